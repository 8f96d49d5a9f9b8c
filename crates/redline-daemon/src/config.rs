use anyhow::{Context, Result, bail};
use clap::Parser;
use libredline::{KillSwitchConfig, SessionLimits};
use nix::unistd::Uid;
use redline_protocol::paths;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_OUTBOUND_QUEUE: usize = 256;

#[derive(Parser, Debug, Default)]
#[command(name = "redline-daemon", about = "redline engagement control-plane daemon")]
pub struct Args {
    /// Path to the control socket.
    #[arg(long = "socket")]
    pub socket_path: Option<PathBuf>,
    /// TOML config file.
    #[arg(long = "config")]
    pub config_path: Option<PathBuf>,
    /// Directory for checkpoints and the audit log.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
    /// Maximum number of concurrently active engagements.
    #[arg(long)]
    pub max_engagements: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    socket_path: Option<PathBuf>,
    runtime_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    max_engagements: Option<usize>,
    max_retained_completed: Option<usize>,
    shutdown_timeout_secs: Option<u64>,
    outbound_queue: Option<usize>,
    #[serde(default)]
    kill_switch: KillSwitchSection,
    #[serde(default)]
    sandbox: SandboxSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct KillSwitchSection {
    bus_budget_ms: Option<u64>,
    process_budget_ms: Option<u64>,
    sandbox_budget_ms: Option<u64>,
    sandbox_stop_timeout_ms: Option<u64>,
    halt_topic: Option<String>,
    #[serde(default)]
    process_groups: Vec<i32>,
    audit_log: Option<PathBuf>,
    halt_key: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SandboxSection {
    #[serde(default)]
    runtime: SandboxKind,
    binary: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    #[default]
    None,
    Container,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub runtime_dir: PathBuf,
    pub pid_file: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: Option<PathBuf>,
    pub allowed_uid: u32,
    pub outbound_queue: usize,
    pub limits: SessionLimits,
    pub kill_switch: KillSwitchConfig,
    pub process_groups: Vec<i32>,
    /// Persisted secp256k1 key that signs halt announcements.
    pub halt_key: PathBuf,
    pub sandbox: SandboxKind,
    pub sandbox_binary: PathBuf,
    max_engagements_override: Option<usize>,
}

impl DaemonConfig {
    /// Resolve from CLI arguments, the config file and defaults, in that order.
    pub fn load(args: &Args) -> Result<Self> {
        let config_path = args.config_path.clone().or_else(|| {
            let default = paths::config_path();
            default.exists().then_some(default)
        });
        let file = match &config_path {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, config_path, file)
    }

    fn resolve(args: &Args, config_path: Option<PathBuf>, file: FileConfig) -> Result<Self> {
        let runtime_dir = file.runtime_dir.unwrap_or_else(paths::default_runtime_dir);
        let socket_path = args
            .socket_path
            .clone()
            .or(file.socket_path)
            .unwrap_or_else(|| runtime_dir.join("redline.sock"));
        let pid_file = socket_path.with_extension("pid");
        let state_dir = args
            .state_dir
            .clone()
            .or(file.state_dir)
            .unwrap_or_else(paths::default_state_dir);

        let limits = limits_from(
            args.max_engagements,
            file.max_engagements,
            file.max_retained_completed,
            file.shutdown_timeout_secs,
        )?;

        let ks = file.kill_switch;
        let defaults = KillSwitchConfig::default();
        let kill_switch = KillSwitchConfig {
            bus_budget: ms_or(ks.bus_budget_ms, defaults.bus_budget),
            process_budget: ms_or(ks.process_budget_ms, defaults.process_budget),
            sandbox_budget: ms_or(ks.sandbox_budget_ms, defaults.sandbox_budget),
            sandbox_stop_timeout: ms_or(ks.sandbox_stop_timeout_ms, defaults.sandbox_stop_timeout),
            halt_topic: ks.halt_topic.unwrap_or(defaults.halt_topic),
            audit_log: Some(ks.audit_log.unwrap_or_else(|| state_dir.join("audit.jsonl"))),
        };
        kill_switch.validate().context("invalid [kill_switch] section")?;
        let halt_key = ks.halt_key.unwrap_or_else(|| state_dir.join("halt.key"));

        let outbound_queue = file.outbound_queue.unwrap_or(DEFAULT_OUTBOUND_QUEUE);
        if outbound_queue == 0 {
            bail!("outbound_queue must be at least 1");
        }

        Ok(Self {
            socket_path,
            runtime_dir,
            pid_file,
            state_dir,
            config_path,
            allowed_uid: Uid::effective().as_raw(),
            outbound_queue,
            limits,
            kill_switch,
            process_groups: ks.process_groups,
            halt_key,
            sandbox: file.sandbox.runtime,
            sandbox_binary: file.sandbox.binary.unwrap_or_else(|| PathBuf::from("docker")),
            max_engagements_override: args.max_engagements,
        })
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join("engagements")
    }

    /// Re-read the config file and return the limits it now specifies.
    /// `--max-engagements` keeps precedence over the file.
    pub fn reload_limits(&self) -> Result<SessionLimits> {
        let file = match &self.config_path {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };
        limits_from(
            self.max_engagements_override,
            file.max_engagements,
            file.max_retained_completed,
            file.shutdown_timeout_secs,
        )
    }
}

pub fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str::<FileConfig>(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

fn limits_from(
    cli_max: Option<usize>,
    file_max: Option<usize>,
    retained: Option<usize>,
    shutdown_secs: Option<u64>,
) -> Result<SessionLimits> {
    let defaults = SessionLimits::default();
    let limits = SessionLimits {
        max_engagements: cli_max.or(file_max).unwrap_or(defaults.max_engagements),
        max_retained_completed: retained.unwrap_or(defaults.max_retained_completed),
        shutdown_timeout: shutdown_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_timeout),
    };
    if limits.max_engagements == 0 {
        bail!("max_engagements must be at least 1");
    }
    if limits.shutdown_timeout.is_zero() {
        bail!("shutdown_timeout_secs must be at least 1");
    }
    Ok(limits)
}

fn ms_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}
