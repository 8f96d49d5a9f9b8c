//! Emergency stop.
//!
//! Triggering freezes the daemon synchronously, then halts work along three
//! independent paths that run in parallel, each bounded by its own budget:
//! a signed announcement on the coordination bus, SIGTERM to registered
//! worker process groups, and a stop/kill sweep over labelled sandboxes.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use anyhow::bail;
use futures_util::future::join_all;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, getpgrp};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use redline_protocol::EngagementId;

use crate::collaborators::{CollaboratorError, CoordinationBus, SandboxHandle, SandboxRuntime};
use crate::engagement::epoch_ms;
use crate::signing::{self, HaltAnnouncement, HaltSigner};

pub const AUDIT_TARGET: &str = "redline::audit";
pub const DEFAULT_HALT_TOPIC: &str = "redline.halt";

/// Upper bound for any single path budget; the paths run in parallel so the
/// whole trigger stays under one second.
pub const MAX_PATH_BUDGET: Duration = Duration::from_millis(900);

/// Cap on the audit-file append that follows the paths.
const AUDIT_WRITE_BUDGET: Duration = Duration::from_millis(100);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("kill switch engaged: {reason}")]
pub struct Halted {
    pub reason: String,
}

struct FrozenState {
    flag: AtomicBool,
    reason: Mutex<String>,
}

impl FrozenState {
    fn reason(&self) -> MutexGuard<'_, String> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap handle workers poll at every action boundary.
#[derive(Clone)]
pub struct HaltCheck {
    state: Arc<FrozenState>,
}

impl HaltCheck {
    pub fn is_frozen(&self) -> bool {
        self.state.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Halted> {
        if self.is_frozen() {
            Err(Halted {
                reason: self.state.reason().clone(),
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct KillSwitchConfig {
    pub bus_budget: Duration,
    pub process_budget: Duration,
    pub sandbox_budget: Duration,
    pub sandbox_stop_timeout: Duration,
    pub halt_topic: String,
    pub audit_log: Option<PathBuf>,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            bus_budget: Duration::from_millis(500),
            process_budget: Duration::from_millis(300),
            sandbox_budget: Duration::from_millis(600),
            sandbox_stop_timeout: Duration::from_millis(250),
            halt_topic: DEFAULT_HALT_TOPIC.to_string(),
            audit_log: None,
        }
    }
}

impl KillSwitchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, budget) in [
            ("bus_budget", self.bus_budget),
            ("process_budget", self.process_budget),
            ("sandbox_budget", self.sandbox_budget),
        ] {
            if budget.is_zero() || budget > MAX_PATH_BUDGET {
                bail!(
                    "{name} must be between 1 and {} ms, got {} ms",
                    MAX_PATH_BUDGET.as_millis(),
                    budget.as_millis()
                );
            }
        }
        if self.sandbox_stop_timeout.is_zero() || self.sandbox_stop_timeout > self.sandbox_budget {
            bail!("sandbox_stop_timeout must be non-zero and within sandbox_budget");
        }
        if self.halt_topic.is_empty() {
            bail!("halt_topic must not be empty");
        }
        Ok(())
    }
}

/// Sends the termination signal to a worker process group.
pub trait ProcessSignaller: Send + Sync {
    fn terminate_group(&self, pgid: i32) -> nix::Result<()>;
}

pub struct NixSignaller;

impl ProcessSignaller for NixSignaller {
    fn terminate_group(&self, pgid: i32) -> nix::Result<()> {
        killpg(Pid::from_raw(pgid), Signal::SIGTERM)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillPath {
    Bus,
    LocalProcess,
    Sandbox,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathOutcome {
    pub path: KillPath,
    pub success: bool,
    pub timed_out: bool,
    pub detail: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchResult {
    pub reason: String,
    pub actor: String,
    pub engagements: Vec<EngagementId>,
    pub triggered_at_epoch_ms: u64,
    pub success: bool,
    pub duration_ms: u64,
    pub paths: Vec<PathOutcome>,
}

impl KillSwitchResult {
    pub fn path(&self, path: KillPath) -> Option<&PathOutcome> {
        self.paths.iter().find(|p| p.path == path)
    }
}

type PathResult = Result<String, String>;

pub struct KillSwitch {
    state: Arc<FrozenState>,
    config: KillSwitchConfig,
    signer: HaltSigner,
    bus: Arc<dyn CoordinationBus>,
    sandboxes: Arc<dyn SandboxRuntime>,
    signaller: Arc<dyn ProcessSignaller>,
    process_groups: Mutex<BTreeSet<i32>>,
    own_pgid: i32,
    last_result: Mutex<Option<KillSwitchResult>>,
}

impl KillSwitch {
    pub fn new(
        config: KillSwitchConfig,
        bus: Arc<dyn CoordinationBus>,
        sandboxes: Arc<dyn SandboxRuntime>,
    ) -> Self {
        Self {
            state: Arc::new(FrozenState {
                flag: AtomicBool::new(false),
                reason: Mutex::new(String::new()),
            }),
            config,
            signer: HaltSigner::generate(),
            bus,
            sandboxes,
            signaller: Arc::new(NixSignaller),
            process_groups: Mutex::new(BTreeSet::new()),
            own_pgid: getpgrp().as_raw(),
            last_result: Mutex::new(None),
        }
    }

    pub fn with_signaller(mut self, signaller: Arc<dyn ProcessSignaller>) -> Self {
        self.signaller = signaller;
        self
    }

    pub fn with_signer(mut self, signer: HaltSigner) -> Self {
        self.signer = signer;
        self
    }

    pub fn config(&self) -> &KillSwitchConfig {
        &self.config
    }

    /// Key subscribers pin to verify halt announcements.
    pub fn public_key_b64(&self) -> &str {
        self.signer.public_key_b64()
    }

    pub fn is_frozen(&self) -> bool {
        self.state.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Halted> {
        self.halt_check().check()
    }

    pub fn halt_check(&self) -> HaltCheck {
        HaltCheck {
            state: Arc::clone(&self.state),
        }
    }

    fn groups(&self) -> MutexGuard<'_, BTreeSet<i32>> {
        self.process_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a worker process group for the local-process path. Groups 0 and 1
    /// and the daemon's own group are refused.
    pub fn register_process_group(&self, pgid: i32) -> bool {
        if pgid <= 1 || pgid == self.own_pgid {
            warn!(pgid, "refusing to register process group");
            return false;
        }
        self.groups().insert(pgid);
        true
    }

    pub fn unregister_process_group(&self, pgid: i32) -> bool {
        self.groups().remove(&pgid)
    }

    pub fn process_groups(&self) -> Vec<i32> {
        self.groups().iter().copied().collect()
    }

    pub fn last_result(&self) -> Option<KillSwitchResult> {
        self.last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear the frozen flag. Returns whether it was set.
    pub fn reset(&self, actor: &str) -> bool {
        let was_frozen = self.state.flag.swap(false, Ordering::SeqCst);
        if was_frozen {
            self.state.reason().clear();
            info!(target: AUDIT_TARGET, actor, "kill switch reset");
        }
        was_frozen
    }

    /// Freeze immediately, then halt along every path.
    ///
    /// The flag is set before this returns, so any `check()` issued after the
    /// call fails even if the returned future is never polled.
    pub fn trigger<'a>(
        &'a self,
        reason: &str,
        actor: &str,
        engagements: Vec<EngagementId>,
    ) -> impl Future<Output = KillSwitchResult> + use<'a> {
        let triggered_at = SystemTime::now();
        *self.state.reason() = reason.to_string();
        self.state.flag.store(true, Ordering::SeqCst);
        warn!(target: AUDIT_TARGET, reason, actor, "kill switch engaged");

        let reason = reason.to_string();
        let actor = actor.to_string();
        async move { self.halt(reason, actor, engagements, triggered_at).await }
    }

    async fn halt(
        &self,
        reason: String,
        actor: String,
        engagements: Vec<EngagementId>,
        triggered_at: SystemTime,
    ) -> KillSwitchResult {
        let started = Instant::now();
        let announcement = HaltAnnouncement {
            reason: reason.clone(),
            actor: actor.clone(),
            engagements: engagements.clone(),
            issued_at_epoch_ms: epoch_ms(triggered_at),
            nonce: signing::nonce(),
        };

        let (bus, process, sandbox) = tokio::join!(
            bounded(KillPath::Bus, self.config.bus_budget, self.bus_path(&announcement)),
            bounded(
                KillPath::LocalProcess,
                self.config.process_budget,
                self.process_path()
            ),
            bounded(
                KillPath::Sandbox,
                self.config.sandbox_budget,
                self.sandbox_path(&engagements)
            ),
        );

        let paths = vec![bus, process, sandbox];
        let result = KillSwitchResult {
            reason,
            actor,
            engagements,
            triggered_at_epoch_ms: epoch_ms(triggered_at),
            success: paths.iter().all(|p| p.success),
            duration_ms: started.elapsed().as_millis() as u64,
            paths,
        };

        self.audit(&result).await;
        *self
            .last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        result
    }

    async fn bus_path(&self, announcement: &HaltAnnouncement) -> PathResult {
        let signed = self
            .signer
            .sign(announcement)
            .map_err(|e| format!("signing failed: {e}"))?;
        let delivered = self
            .bus
            .publish(&self.config.halt_topic, &signed)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("published to {delivered} receivers"))
    }

    async fn process_path(&self) -> PathResult {
        let groups = self.process_groups();
        if groups.is_empty() {
            return Ok("no registered process groups".to_string());
        }

        let mut signalled = 0;
        let mut gone = 0;
        let mut failures = Vec::new();
        for pgid in groups {
            if pgid <= 1 || pgid == self.own_pgid {
                continue;
            }
            match self.signaller.terminate_group(pgid) {
                Ok(()) => signalled += 1,
                Err(Errno::ESRCH) => gone += 1,
                Err(errno) => {
                    warn!(pgid, error = %errno, "failed to signal process group");
                    failures.push(format!("{pgid}: {errno}"));
                }
            }
        }

        let summary = format!("signalled {signalled}, already gone {gone}");
        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(format!("{summary}, failed {}", failures.join("; ")))
        }
    }

    async fn sandbox_path(&self, engagements: &[EngagementId]) -> PathResult {
        let sweeps = join_all(engagements.iter().map(|id| self.sweep_engagement(id))).await;

        let mut stopped = 0;
        let mut killed = 0;
        let mut failures = Vec::new();
        for sweep in sweeps {
            stopped += sweep.stopped;
            killed += sweep.killed;
            failures.extend(sweep.failures);
        }

        let summary = format!("stopped {stopped}, killed {killed}");
        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(format!("{summary}, failed {}", failures.join("; ")))
        }
    }

    /// List one engagement's sandboxes and halt them as soon as the listing returns.
    async fn sweep_engagement(&self, engagement_id: &str) -> SandboxSweep {
        let mut sweep = SandboxSweep::default();
        let handles = match self.sandboxes.list_by_label(engagement_id).await {
            Ok(handles) => handles,
            Err(e) => {
                sweep.failures.push(format!("{engagement_id}: {e}"));
                return sweep;
            }
        };

        let outcomes = join_all(handles.iter().map(|h| self.halt_sandbox(h))).await;
        for (handle, outcome) in handles.iter().zip(outcomes) {
            match outcome {
                Ok(SandboxHalt::Stopped) => sweep.stopped += 1,
                Ok(SandboxHalt::Killed) => sweep.killed += 1,
                Err(e) => sweep.failures.push(format!("{}: {e}", handle.id)),
            }
        }
        sweep
    }

    async fn halt_sandbox(&self, handle: &SandboxHandle) -> Result<SandboxHalt, CollaboratorError> {
        match self
            .sandboxes
            .stop(handle, self.config.sandbox_stop_timeout)
            .await
        {
            Ok(()) | Err(CollaboratorError::AlreadyStopped) => return Ok(SandboxHalt::Stopped),
            Err(e) => warn!(sandbox = %handle.id, error = %e, "graceful stop failed, killing"),
        }
        match self.sandboxes.kill(handle).await {
            Ok(()) => Ok(SandboxHalt::Killed),
            Err(CollaboratorError::AlreadyStopped) => Ok(SandboxHalt::Stopped),
            Err(e) => Err(e),
        }
    }

    async fn audit(&self, result: &KillSwitchResult) {
        let paths = serde_json::to_string(&result.paths).unwrap_or_default();
        if result.success {
            info!(
                target: AUDIT_TARGET,
                reason = %result.reason,
                actor = %result.actor,
                duration_ms = result.duration_ms,
                paths = %paths,
                "kill switch completed"
            );
        } else {
            warn!(
                target: AUDIT_TARGET,
                reason = %result.reason,
                actor = %result.actor,
                duration_ms = result.duration_ms,
                paths = %paths,
                "kill switch completed with failures"
            );
        }

        let Some(path) = &self.config.audit_log else {
            return;
        };
        match tokio::time::timeout(AUDIT_WRITE_BUDGET, append_json_line(path, result)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(path = %path.display(), error = %e, "failed to append audit record"),
            Err(_) => warn!(
                path = %path.display(),
                budget_ms = AUDIT_WRITE_BUDGET.as_millis() as u64,
                "audit append timed out"
            ),
        }
    }
}

enum SandboxHalt {
    Stopped,
    Killed,
}

#[derive(Default)]
struct SandboxSweep {
    stopped: usize,
    killed: usize,
    failures: Vec<String>,
}

async fn bounded(
    path: KillPath,
    budget: Duration,
    work: impl Future<Output = PathResult>,
) -> PathOutcome {
    let started = Instant::now();
    let (success, timed_out, detail) = match tokio::time::timeout(budget, work).await {
        Ok(Ok(detail)) => (true, false, detail),
        Ok(Err(detail)) => (false, false, detail),
        Err(_) => (
            false,
            true,
            format!("exceeded {} ms budget", budget.as_millis()),
        ),
    };
    PathOutcome {
        path,
        success,
        timed_out,
        detail,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

async fn append_json_line(path: &Path, result: &KillSwitchResult) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(result)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
