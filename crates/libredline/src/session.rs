use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use redline_protocol::{EngagementId, EngagementState, EngagementSummary, Notification};

use crate::collaborators::CheckpointStore;
use crate::engagement::{EngagementContext, derive_name, epoch_ms, generate_id};
use crate::error::RedlineError;
use crate::kill_switch::{KillSwitch, KillSwitchResult};
use crate::lifecycle::{Action, Transition};
use crate::subscriptions::{Callback, SubscriberId, SubscriptionRegistry};

/// Fresh ids to try before giving up on a name.
const ID_ATTEMPTS: usize = 8;

/// Limits that `daemon.config.reload` can change without a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionLimits {
    pub max_engagements: usize,
    pub max_retained_completed: usize,
    #[serde(rename = "shutdown_timeout_secs", serialize_with = "as_secs")]
    pub shutdown_timeout: Duration,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_engagements: 5,
            max_retained_completed: 100,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownFailure {
    pub engagement_id: EngagementId,
    pub stage: &'static str,
    pub error: String,
}

/// What a graceful shutdown managed to do before finishing or timing out.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub reason: String,
    pub notified: usize,
    pub paused: Vec<EngagementId>,
    pub checkpoints: Vec<PathBuf>,
    pub stopped: Vec<EngagementId>,
    pub failures: Vec<ShutdownFailure>,
    pub kill: Option<KillSwitchResult>,
    pub subscriptions_cleared: usize,
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

impl ShutdownReport {
    fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            notified: 0,
            paused: Vec::new(),
            checkpoints: Vec::new(),
            stopped: Vec::new(),
            failures: Vec::new(),
            kill: None,
            subscriptions_cleared: 0,
            timed_out: false,
            elapsed_ms: 0,
        }
    }

    fn fail(&mut self, engagement_id: &str, stage: &'static str, error: impl ToString) {
        let error = error.to_string();
        warn!(engagement_id, stage, error = %error, "shutdown step failed");
        self.failures.push(ShutdownFailure {
            engagement_id: engagement_id.to_string(),
            stage,
            error,
        });
    }
}

#[derive(Default)]
struct Registry {
    contexts: HashMap<EngagementId, EngagementContext>,
    next_seq: u64,
}

impl Registry {
    fn active_count(&self) -> usize {
        self.contexts
            .values()
            .filter(|c| c.state().is_active())
            .count()
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut EngagementContext, RedlineError> {
        self.contexts
            .get_mut(id)
            .ok_or_else(|| RedlineError::NotFound(id.to_string()))
    }

    /// Drop the oldest completed engagements beyond `keep`. Returns the dropped ids.
    fn prune_completed(&mut self, keep: usize) -> Vec<EngagementId> {
        let mut completed: Vec<_> = self
            .contexts
            .values()
            .filter(|c| c.state() == EngagementState::Completed)
            .map(|c| (c.seq(), c.id().to_string()))
            .collect();
        if completed.len() <= keep {
            return Vec::new();
        }
        completed.sort();
        let excess = completed.len() - keep;
        completed
            .into_iter()
            .take(excess)
            .map(|(_, id)| {
                self.contexts.remove(&id);
                id
            })
            .collect()
    }
}

/// Sole owner of the engagement table.
///
/// The table sits behind one async mutex, so capacity checks and inserts
/// are atomic with respect to each other. Subscriptions and the kill switch
/// are shared with the transport layer.
pub struct SessionManager {
    registry: Mutex<Registry>,
    subscriptions: Arc<SubscriptionRegistry>,
    kill_switch: Arc<KillSwitch>,
    checkpoints: Arc<dyn CheckpointStore>,
    limits: RwLock<SessionLimits>,
    shutting_down: AtomicBool,
}

impl SessionManager {
    pub fn new(
        limits: SessionLimits,
        kill_switch: Arc<KillSwitch>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            kill_switch,
            checkpoints,
            limits: RwLock::new(limits),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.kill_switch
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn limits(&self) -> SessionLimits {
        *self.limits.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_accepting(&self) -> Result<(), RedlineError> {
        if self.is_shutting_down() {
            Err(RedlineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Register a new engagement in INITIALIZING.
    pub async fn create(
        &self,
        config_source: impl Into<PathBuf>,
        name: Option<&str>,
    ) -> Result<EngagementId, RedlineError> {
        self.ensure_accepting()?;
        self.kill_switch.check()?;

        let config_source = config_source.into();
        let name = derive_name(&config_source, name)?;
        let max = self.limits().max_engagements;

        let mut registry = self.registry.lock().await;
        self.ensure_accepting()?;
        let active = registry.active_count();
        if active >= max {
            warn!(active, max, name = %name, "engagement rejected at capacity");
            return Err(RedlineError::CapacityExceeded { active, max });
        }

        let id = (0..ID_ATTEMPTS)
            .map(|_| generate_id(&name, Utc::now()))
            .find(|candidate| !registry.contexts.contains_key(candidate))
            .ok_or_else(|| RedlineError::IdExhausted(name.clone()))?;

        let seq = registry.next_seq;
        registry.next_seq += 1;

        let mut ctx = EngagementContext::new(id.clone(), config_source.clone(), seq);
        let subscriptions = Arc::clone(&self.subscriptions);
        ctx.lifecycle.add_listener(move |t: &Transition| {
            subscriptions.broadcast(
                &t.engagement_id,
                &Notification::StateChanged {
                    engagement_id: t.engagement_id.clone(),
                    from: t.from,
                    to: t.to,
                    at_epoch_ms: epoch_ms(t.at),
                },
            );
            Ok(())
        });
        registry.contexts.insert(id.clone(), ctx);

        info!(
            engagement_id = %id,
            config_source = %config_source.display(),
            active = active + 1,
            max,
            "engagement created"
        );
        Ok(id)
    }

    pub async fn start(&self, id: &str) -> Result<EngagementState, RedlineError> {
        self.transition(id, Action::Start).await
    }

    pub async fn pause(&self, id: &str) -> Result<EngagementState, RedlineError> {
        self.transition(id, Action::Pause).await
    }

    pub async fn resume(&self, id: &str) -> Result<EngagementState, RedlineError> {
        self.transition(id, Action::Resume).await
    }

    pub async fn stop(&self, id: &str) -> Result<EngagementState, RedlineError> {
        self.transition(id, Action::Stop).await
    }

    pub async fn complete(&self, id: &str) -> Result<EngagementState, RedlineError> {
        self.transition(id, Action::Complete).await
    }

    async fn transition(&self, id: &str, action: Action) -> Result<EngagementState, RedlineError> {
        self.ensure_accepting()?;
        if matches!(action, Action::Start | Action::Resume) {
            self.kill_switch.check()?;
        }

        let mut registry = self.registry.lock().await;
        let ctx = registry.get_mut(id)?;
        let from = ctx.state();
        let to = ctx.lifecycle.apply(action)?;
        info!(engagement_id = %id, action = %action, from = %from, to = %to, "engagement transition");

        if matches!(action, Action::Complete) {
            let keep = self.limits().max_retained_completed;
            for pruned in registry.prune_completed(keep) {
                self.subscriptions.remove_engagement(&pruned);
                info!(engagement_id = %pruned, keep, "pruned completed engagement");
            }
        }
        Ok(to)
    }

    /// Summaries, newest first by creation sequence.
    pub async fn list(&self) -> Vec<EngagementSummary> {
        let registry = self.registry.lock().await;
        let mut contexts: Vec<&EngagementContext> = registry.contexts.values().collect();
        contexts.sort_by_key(|c| std::cmp::Reverse(c.seq()));
        contexts.into_iter().map(EngagementContext::to_summary).collect()
    }

    pub async fn get(&self, id: &str) -> Result<EngagementSummary, RedlineError> {
        self.registry
            .lock()
            .await
            .contexts
            .get(id)
            .map(EngagementContext::to_summary)
            .ok_or_else(|| RedlineError::NotFound(id.to_string()))
    }

    /// Forget a finished engagement. `Ok(false)` if it was unknown.
    pub async fn remove(&self, id: &str) -> Result<bool, RedlineError> {
        self.ensure_accepting()?;
        let mut registry = self.registry.lock().await;
        let Some(ctx) = registry.contexts.get(id) else {
            return Ok(false);
        };
        let state = ctx.state();
        if state.is_active() {
            return Err(RedlineError::StillActive {
                id: id.to_string(),
                state,
            });
        }
        registry.contexts.remove(id);
        drop(registry);

        let dropped = self.subscriptions.remove_engagement(id);
        info!(engagement_id = %id, state = %state, subscriptions = dropped, "engagement removed");
        Ok(true)
    }

    pub async fn update_counters(
        &self,
        id: &str,
        agents: Option<u64>,
        findings: Option<u64>,
    ) -> Result<EngagementSummary, RedlineError> {
        let mut registry = self.registry.lock().await;
        let ctx = registry.get_mut(id)?;
        if let Some(agents) = agents {
            ctx.counters.agents = agents;
        }
        if let Some(findings) = findings {
            ctx.counters.findings = findings;
        }
        Ok(ctx.to_summary())
    }

    pub async fn subscribe(&self, id: &str, callback: Callback) -> Result<SubscriberId, RedlineError> {
        self.ensure_accepting()?;
        let registry = self.registry.lock().await;
        if !registry.contexts.contains_key(id) {
            return Err(RedlineError::NotFound(id.to_string()));
        }
        Ok(self.subscriptions.subscribe(id, callback))
    }

    pub fn unsubscribe(&self, id: &str, subscriber_id: &str) -> bool {
        self.subscriptions.unsubscribe(id, subscriber_id)
    }

    pub async fn active_count(&self) -> usize {
        self.registry.lock().await.active_count()
    }

    /// Swap in new limits. Existing engagements above a lowered capacity keep
    /// running; only new admissions see the new bound.
    pub async fn apply_limits(&self, limits: SessionLimits) {
        *self.limits.write().unwrap_or_else(PoisonError::into_inner) = limits;
        let pruned = self
            .registry
            .lock()
            .await
            .prune_completed(limits.max_retained_completed);
        for id in &pruned {
            self.subscriptions.remove_engagement(id);
        }
        info!(
            max_engagements = limits.max_engagements,
            max_retained_completed = limits.max_retained_completed,
            shutdown_timeout_secs = limits.shutdown_timeout.as_secs(),
            pruned = pruned.len(),
            "session limits applied"
        );
    }

    /// Fire the kill switch over every known engagement, then pause whatever
    /// is still running and tell every subscriber.
    pub async fn emergency_stop(&self, reason: &str, actor: &str) -> KillSwitchResult {
        let ids = self.known_ids().await;
        let result = self.kill_switch.trigger(reason, actor, ids).await;

        let mut registry = self.registry.lock().await;
        for ctx in registry.contexts.values_mut() {
            if ctx.state() == EngagementState::Running {
                if let Err(e) = ctx.lifecycle.pause() {
                    warn!(engagement_id = %ctx.id(), error = %e, "failed to pause on halt");
                }
            }
        }
        drop(registry);

        self.subscriptions.broadcast_all(&Notification::Halted {
            reason: reason.to_string(),
            actor: actor.to_string(),
        });
        result
    }

    /// Graceful shutdown, bounded by the configured timeout.
    ///
    /// Once started every other mutating call fails with `ShuttingDown`.
    /// Subscriptions are cleared even when the timeout elapses.
    pub async fn shutdown(&self, reason: &str) -> ShutdownReport {
        let started = Instant::now();
        let timeout = self.limits().shutdown_timeout;
        self.shutting_down.store(true, Ordering::SeqCst);
        info!(reason, timeout_secs = timeout.as_secs(), "graceful shutdown started");

        let mut report = ShutdownReport::new(reason);
        if tokio::time::timeout(timeout, self.shutdown_steps(&mut report))
            .await
            .is_err()
        {
            report.timed_out = true;
            warn!(
                timeout_secs = timeout.as_secs(),
                stopped = report.stopped.len(),
                "shutdown timed out, abandoning remaining steps"
            );
        }
        if report.kill.is_none() {
            // The kill switch bounds itself, so it runs outside the shutdown timeout.
            let ids = self.known_ids().await;
            report.kill = Some(
                self.kill_switch
                    .trigger("daemon shutdown (timeout)", "daemon", ids)
                    .await,
            );
        }

        report.subscriptions_cleared = self.subscriptions.clear();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            paused = report.paused.len(),
            stopped = report.stopped.len(),
            failures = report.failures.len(),
            timed_out = report.timed_out,
            elapsed_ms = report.elapsed_ms,
            "graceful shutdown finished"
        );
        report
    }

    async fn known_ids(&self) -> Vec<EngagementId> {
        self.registry.lock().await.contexts.keys().cloned().collect()
    }

    async fn shutdown_steps(&self, report: &mut ShutdownReport) {
        report.notified = self.subscriptions.broadcast_all(&Notification::Shutdown {
            reason: report.reason.clone(),
            countdown_secs: self.limits().shutdown_timeout.as_secs(),
        });

        let (to_checkpoint, all_ids) = {
            let mut registry = self.registry.lock().await;
            for ctx in registry.contexts.values_mut() {
                if ctx.state() != EngagementState::Running {
                    continue;
                }
                match ctx.lifecycle.pause() {
                    Ok(_) => report.paused.push(ctx.id().to_string()),
                    Err(e) => report.fail(ctx.id(), "pause", e),
                }
            }
            let paused: Vec<(EngagementId, EngagementSummary)> = registry
                .contexts
                .values()
                .filter(|c| c.state() == EngagementState::Paused)
                .map(|c| (c.id().to_string(), c.to_summary()))
                .collect();
            (paused, registry.contexts.keys().cloned().collect::<Vec<_>>())
        };

        // Checkpoint I/O runs without the table lock.
        for (id, summary) in to_checkpoint {
            let path = match self.checkpoints.save(&id, &summary).await {
                Ok(path) => path,
                Err(e) => {
                    report.fail(&id, "checkpoint", e);
                    continue;
                }
            };
            report.checkpoints.push(path);

            let mut registry = self.registry.lock().await;
            let stopped = match registry.get_mut(&id) {
                Ok(ctx) => ctx.lifecycle.stop().map_err(RedlineError::from),
                Err(e) => Err(e),
            };
            match stopped {
                Ok(_) => report.stopped.push(id),
                Err(e) => report.fail(&id, "stop", e),
            }
        }

        report.kill = Some(
            self.kill_switch
                .trigger("daemon shutdown", "daemon", all_ids)
                .await,
        );
    }
}
