use anyhow::{Context, Result, anyhow};
use libredline::{
    CheckpointStore, ContainerCliRuntime, FsCheckpointStore, HaltSigner, KillSwitch, LocalBus,
    NoSandboxRuntime, SandboxRuntime, SessionManager, ShutdownReport,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{DaemonConfig, SandboxKind};
use crate::connection::{Shared, handle_connection};

/// How long connections get to flush queued messages once the transport closes.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Run the daemon until a stop is requested. Returns the shutdown report.
pub async fn run(cfg: DaemonConfig) -> Result<ShutdownReport> {
    ensure_runtime_dir(&cfg.runtime_dir)?;
    if let Some(parent) = cfg.socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("failed to create state dir {}", cfg.state_dir.display()))?;
    remove_stale_socket(&cfg.socket_path)?;

    let listener = UnixListener::bind(&cfg.socket_path)
        .with_context(|| format!("failed to bind {}", cfg.socket_path.display()))?;
    fs::set_permissions(&cfg.socket_path, fs::Permissions::from_mode(0o600))?;
    fs::write(&cfg.pid_file, std::process::id().to_string())?;

    info!(
        pid = std::process::id(),
        socket = %cfg.socket_path.display(),
        max_engagements = cfg.limits.max_engagements,
        "redline-daemon started"
    );

    let manager = Arc::new(build_manager(&cfg)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(None::<String>);
    let (close_tx, close_rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        manager: Arc::clone(&manager),
        config: cfg.clone(),
        shutdown_tx: shutdown_tx.clone(),
        started_at: Instant::now(),
    });

    let signals = spawn_signal_handler(Arc::clone(&manager), shutdown_tx.clone())?;
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    accept_loop(&listener, &shared, shutdown_rx, close_rx, &mut connections).await;

    let reason = shutdown_tx
        .borrow()
        .clone()
        .unwrap_or_else(|| "shutdown".to_string());
    let report = manager.shutdown(&reason).await;

    close_tx.send_replace(true);
    drop(listener);
    drain_connections(connections).await;
    signals.abort();

    let _ = fs::remove_file(&cfg.socket_path);
    let _ = fs::remove_file(&cfg.pid_file);
    Ok(report)
}

fn build_manager(cfg: &DaemonConfig) -> Result<SessionManager> {
    let sandboxes: Arc<dyn SandboxRuntime> = match cfg.sandbox {
        SandboxKind::None => Arc::new(NoSandboxRuntime),
        SandboxKind::Container => Arc::new(ContainerCliRuntime::new(&cfg.sandbox_binary)),
    };
    let signer = HaltSigner::load_or_create(Some(&cfg.halt_key))?;
    let kill_switch = KillSwitch::new(cfg.kill_switch.clone(), Arc::new(LocalBus::default()), sandboxes)
        .with_signer(signer);
    info!(
        halt_key = %cfg.halt_key.display(),
        public_key = kill_switch.public_key_b64(),
        "halt signing key loaded"
    );
    for pgid in &cfg.process_groups {
        kill_switch.register_process_group(*pgid);
    }
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(FsCheckpointStore::new(cfg.checkpoint_dir()));
    Ok(SessionManager::new(cfg.limits, Arc::new(kill_switch), checkpoints))
}

async fn accept_loop(
    listener: &UnixListener,
    shared: &Arc<Shared>,
    mut shutdown_rx: watch::Receiver<Option<String>>,
    close_rx: watch::Receiver<bool>,
    connections: &mut Vec<JoinHandle<()>>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || shutdown_rx.borrow().is_some() {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };

                if let Err(err) = verify_peer_uid(&stream, shared.config.allowed_uid) {
                    warn!("rejected peer: {err}");
                    continue;
                }

                connections.retain(|handle| !handle.is_finished());
                connections.push(tokio::spawn(handle_connection(
                    stream,
                    Arc::clone(shared),
                    close_rx.clone(),
                )));
            }
        }
    }
}

async fn drain_connections(connections: Vec<JoinHandle<()>>) {
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    for mut handle in connections {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            handle.abort();
        }
    }
}

fn spawn_signal_handler(
    manager: Arc<SessionManager>,
    shutdown_tx: watch::Sender<Option<String>>,
) -> Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
                _ = sigusr1.recv() => {
                    let result = manager.emergency_stop("SIGUSR1", "signal").await;
                    if !result.success {
                        error!(duration_ms = result.duration_ms, "kill switch finished with failed paths");
                    }
                    continue;
                }
            };
            info!(signal = name, "graceful shutdown requested");
            shutdown_tx.send_replace(Some(format!("received {name}")));
        }
    }))
}

fn ensure_runtime_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create runtime dir {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    Ok(())
}

fn verify_peer_uid(stream: &UnixStream, expected_uid: u32) -> Result<()> {
    let creds = stream
        .peer_cred()
        .context("failed to query peer credentials")?;
    let uid = creds.uid();
    if uid != expected_uid {
        return Err(anyhow!(
            "peer uid {uid} is not allowed (expected {expected_uid})"
        ));
    }
    Ok(())
}
