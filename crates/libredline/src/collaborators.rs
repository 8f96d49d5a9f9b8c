//! Interfaces to the systems the control plane drives but does not own:
//! durable checkpoints, the coordination bus and the sandbox runtime.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::debug;

use redline_protocol::EngagementSummary;

use crate::engagement::{epoch_ms, is_safe_id};
use crate::signing::SignedPayload;

/// Container label tying a sandbox to its engagement.
pub const ENGAGEMENT_LABEL: &str = "redline.engagement";

const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("already stopped")]
    AlreadyStopped,

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot of the engagement. Idempotent; returns where it was written.
    async fn save(
        &self,
        engagement_id: &str,
        summary: &EngagementSummary,
    ) -> Result<PathBuf, CollaboratorError>;
}

#[derive(Serialize)]
struct CheckpointRecord<'a> {
    format: u32,
    saved_at_epoch_ms: u64,
    engagement: &'a EngagementSummary,
}

/// Writes `<root>/<engagement_id>/checkpoint.json` via write-then-rename.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    root: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn checkpoint_path(&self, engagement_id: &str) -> PathBuf {
        self.root.join(engagement_id).join(CHECKPOINT_FILE)
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn save(
        &self,
        engagement_id: &str,
        summary: &EngagementSummary,
    ) -> Result<PathBuf, CollaboratorError> {
        if !is_safe_id(engagement_id) {
            return Err(CollaboratorError::Failed(format!(
                "refusing unsafe engagement id {engagement_id:?}"
            )));
        }

        let dir = self.root.join(engagement_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_failure(&dir, e))?;

        let record = CheckpointRecord {
            format: 1,
            saved_at_epoch_ms: epoch_ms(SystemTime::now()),
            engagement: summary,
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| CollaboratorError::Failed(e.to_string()))?;

        let final_path = dir.join(CHECKPOINT_FILE);
        let tmp_path = dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        tokio::fs::write(&tmp_path, &json)
            .await
            .map_err(|e| io_failure(&tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| io_failure(&final_path, e))?;

        debug!(engagement_id, path = %final_path.display(), "checkpoint written");
        Ok(final_path)
    }
}

fn io_failure(path: &Path, err: std::io::Error) -> CollaboratorError {
    CollaboratorError::Failed(format!("{}: {err}", path.display()))
}

// ---------------------------------------------------------------------------
// Coordination bus
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CoordinationBus: Send + Sync {
    /// Publish a signed payload. Returns how many receivers it reached.
    async fn publish(&self, topic: &str, payload: &SignedPayload)
    -> Result<usize, CollaboratorError>;
}

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: SignedPayload,
}

/// In-process bus backed by a tokio broadcast channel.
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl CoordinationBus for LocalBus {
    async fn publish(
        &self,
        topic: &str,
        payload: &SignedPayload,
    ) -> Result<usize, CollaboratorError> {
        let message = BusMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
        };
        // No receivers is a valid (empty) delivery.
        Ok(self.tx.send(message).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Execution sandboxes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn list_by_label(
        &self,
        engagement_id: &str,
    ) -> Result<Vec<SandboxHandle>, CollaboratorError>;

    /// Graceful stop bounded by `timeout`. `AlreadyStopped` is a success for callers.
    async fn stop(&self, handle: &SandboxHandle, timeout: Duration)
    -> Result<(), CollaboratorError>;

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), CollaboratorError>;
}

/// Runtime for hosts without sandboxes: nothing to list, nothing to stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSandboxRuntime;

#[async_trait]
impl SandboxRuntime for NoSandboxRuntime {
    async fn list_by_label(
        &self,
        _engagement_id: &str,
    ) -> Result<Vec<SandboxHandle>, CollaboratorError> {
        Ok(Vec::new())
    }

    async fn stop(
        &self,
        _handle: &SandboxHandle,
        _timeout: Duration,
    ) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::AlreadyStopped)
    }

    async fn kill(&self, _handle: &SandboxHandle) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::AlreadyStopped)
    }
}

/// Drives a docker-compatible CLI (`docker`, `podman`, `nerdctl`).
#[derive(Debug, Clone)]
pub struct ContainerCliRuntime {
    binary: PathBuf,
}

impl ContainerCliRuntime {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<Output, CollaboratorError> {
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CollaboratorError::Unavailable(format!("{}: {e}", self.binary.display()))
            })
    }

    async fn run_checked(&self, args: &[String]) -> Result<String, CollaboratorError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_cli_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

#[async_trait]
impl SandboxRuntime for ContainerCliRuntime {
    async fn list_by_label(
        &self,
        engagement_id: &str,
    ) -> Result<Vec<SandboxHandle>, CollaboratorError> {
        let stdout = self
            .run_checked(&[
                "ps".to_string(),
                "--quiet".to_string(),
                "--filter".to_string(),
                format!("label={ENGAGEMENT_LABEL}={engagement_id}"),
            ])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|id| SandboxHandle { id: id.to_string() })
            .collect())
    }

    /// SIGTERM, then wait for the container to exit within `timeout`.
    /// Escalation is left to the caller's `kill`.
    async fn stop(
        &self,
        handle: &SandboxHandle,
        timeout: Duration,
    ) -> Result<(), CollaboratorError> {
        let graceful = async {
            self.run_checked(&[
                "kill".to_string(),
                "--signal".to_string(),
                "SIGTERM".to_string(),
                handle.id.clone(),
            ])
            .await?;
            self.run_checked(&["wait".to_string(), handle.id.clone()])
                .await
                .map(|_| ())
        };
        match tokio::time::timeout(timeout, graceful).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::TimedOut(timeout)),
        }
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), CollaboratorError> {
        self.run_checked(&["kill".to_string(), handle.id.clone()])
            .await
            .map(|_| ())
    }
}

fn classify_cli_failure(stderr: &str) -> CollaboratorError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("no such container") || lowered.contains("is not running") {
        CollaboratorError::AlreadyStopped
    } else if lowered.contains("cannot connect") || lowered.contains("daemon running") {
        CollaboratorError::Unavailable(stderr.trim().to_string())
    } else {
        CollaboratorError::Failed(stderr.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{HaltAnnouncement, HaltSigner};
    use redline_protocol::EngagementState;
    use std::os::unix::fs::PermissionsExt;

    fn summary(id: &str) -> EngagementSummary {
        EngagementSummary {
            id: id.to_string(),
            state: EngagementState::Paused,
            config_source: PathBuf::from("scope.toml"),
            agent_count: 2,
            finding_count: 5,
            created_at_epoch_ms: 1,
            state_since_epoch_ms: 2,
        }
    }

    #[tokio::test]
    async fn fs_checkpoint_store_writes_atomically_and_idempotently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsCheckpointStore::new(dir.path());

        let first = store.save("e-1", &summary("e-1")).await.expect("save");
        let second = store.save("e-1", &summary("e-1")).await.expect("save again");
        assert_eq!(first, second);
        assert_eq!(first, store.checkpoint_path("e-1"));
        assert!(!first.with_extension("json.tmp").exists());

        let raw = std::fs::read_to_string(&first).expect("read checkpoint");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["engagement"]["id"], "e-1");
        assert_eq!(value["engagement"]["state"], "PAUSED");
    }

    #[tokio::test]
    async fn fs_checkpoint_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsCheckpointStore::new(dir.path());
        let err = store.save("../escape", &summary("x")).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Failed(_)));
    }

    #[tokio::test]
    async fn local_bus_counts_receivers() {
        let bus = LocalBus::default();
        let signed = HaltSigner::generate()
            .sign(&HaltAnnouncement {
                reason: "r".to_string(),
                actor: "a".to_string(),
                engagements: vec![],
                issued_at_epoch_ms: 0,
                nonce: "n".to_string(),
            })
            .unwrap();

        assert_eq!(bus.publish("halt", &signed).await.unwrap(), 0);

        let mut rx = bus.subscribe();
        assert_eq!(bus.publish("halt", &signed).await.unwrap(), 1);
        let msg = rx.recv().await.expect("recv");
        assert_eq!(msg.topic, "halt");
    }

    #[test]
    fn cli_failures_are_classified() {
        assert_eq!(
            classify_cli_failure("Error response from daemon: No such container: abc"),
            CollaboratorError::AlreadyStopped
        );
        assert_eq!(
            classify_cli_failure("Error: container abc is not running"),
            CollaboratorError::AlreadyStopped
        );
        assert!(matches!(
            classify_cli_failure("Cannot connect to the Docker daemon. Is the docker daemon running?"),
            CollaboratorError::Unavailable(_)
        ));
        assert!(matches!(
            classify_cli_failure("permission denied"),
            CollaboratorError::Failed(_)
        ));
    }

    #[tokio::test]
    async fn container_runtime_reports_missing_binary() {
        let runtime = ContainerCliRuntime::new("/nonexistent/redline-docker");
        let err = runtime.list_by_label("e-1").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable(_)));
    }

    #[tokio::test]
    async fn container_runtime_drives_cli() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fake-docker");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             echo \"$@\" >> \"$(dirname \"$0\")/calls.log\"\n\
             case \"$1\" in\n\
               ps) echo c1; echo c2; echo c3 ;;\n\
               kill) [ \"$2\" = --signal ] && [ \"$4\" = c2 ] && { echo 'container c2 is not running' >&2; exit 1; }; exit 0 ;;\n\
               wait) [ \"$2\" = c3 ] && sleep 5; echo 0 ;;\n\
             esac\n",
        )
        .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let runtime = ContainerCliRuntime::new(&script);
        let handles = runtime.list_by_label("e-1").await.expect("list");
        let ids: Vec<&str> = handles.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);

        let timeout = Duration::from_secs(2);
        runtime.stop(&handles[0], timeout).await.expect("stop c1");
        assert_eq!(
            runtime.stop(&handles[1], timeout).await,
            Err(CollaboratorError::AlreadyStopped)
        );
        let short = Duration::from_millis(250);
        assert_eq!(
            runtime.stop(&handles[2], short).await,
            Err(CollaboratorError::TimedOut(short))
        );
        runtime.kill(&handles[2]).await.expect("kill");

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).expect("calls log");
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(
            calls,
            vec![
                "ps --quiet --filter label=redline.engagement=e-1",
                "kill --signal SIGTERM c1",
                "wait c1",
                "kill --signal SIGTERM c2",
                "kill --signal SIGTERM c3",
                "wait c3",
                "kill c3",
            ]
        );
    }

    #[tokio::test]
    async fn local_bus_delivers_verifiable_announcements() {
        let bus = LocalBus::default();
        let signer = HaltSigner::generate();
        let signed = signer
            .sign(&HaltAnnouncement {
                reason: "r".to_string(),
                actor: "a".to_string(),
                engagements: vec![],
                issued_at_epoch_ms: 0,
                nonce: "n".to_string(),
            })
            .unwrap();
        let mut rx = bus.subscribe();
        bus.publish("halt", &signed).await.unwrap();
        let msg = rx.recv().await.expect("recv");
        assert!(msg.payload.verify(signer.public_key_b64()));
        assert!(!msg.payload.verify(HaltSigner::generate().public_key_b64()));
    }
}
