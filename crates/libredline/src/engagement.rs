use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;

use redline_protocol::{EngagementId, EngagementState, EngagementSummary};

use crate::error::RedlineError;
use crate::lifecycle::Lifecycle;

/// Longest accepted engagement name, before the timestamp and suffix are appended.
pub const MAX_NAME_LEN: usize = 48;

const SUFFIX_BYTES: usize = 3;

/// Derive an engagement name from an explicit name or the config source's file stem.
pub fn derive_name(config_source: &Path, explicit: Option<&str>) -> Result<String, RedlineError> {
    let raw = match explicit {
        Some(name) => name.to_string(),
        None => config_source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    sanitize_name(&raw)
}

/// Restrict a name to `[a-z0-9-]`, collapsing every other run of characters into one `-`.
pub fn sanitize_name(raw: &str) -> Result<String, RedlineError> {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }

    if out.is_empty() {
        return Err(RedlineError::InvalidName(format!(
            "'{raw}' contains no usable characters"
        )));
    }
    if out.len() > MAX_NAME_LEN {
        return Err(RedlineError::InvalidName(format!(
            "'{raw}' is longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(out)
}

/// `<name>-<YYYYMMDD>-<HHMMSS>-<suffix>`
pub fn generate_id(name: &str, now: DateTime<Utc>) -> EngagementId {
    format!("{name}-{}-{}", now.format("%Y%m%d-%H%M%S"), random_suffix())
}

fn random_suffix() -> String {
    let mut bytes = [0u8; SUFFIX_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let mut out = String::with_capacity(SUFFIX_BYTES * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// True if `id` only uses characters that are safe as a path component.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub(crate) fn epoch_ms(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Live counters fed by the agent collaborators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngagementCounters {
    pub agents: u64,
    pub findings: u64,
}

/// Everything the daemon tracks for one engagement. Owned by the session manager.
#[derive(Debug)]
pub(crate) struct EngagementContext {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) counters: EngagementCounters,
    config_source: PathBuf,
    created_at: SystemTime,
    seq: u64,
}

impl EngagementContext {
    pub(crate) fn new(id: EngagementId, config_source: PathBuf, seq: u64) -> Self {
        Self {
            lifecycle: Lifecycle::new(id),
            counters: EngagementCounters::default(),
            config_source,
            created_at: SystemTime::now(),
            seq,
        }
    }

    pub(crate) fn id(&self) -> &str {
        self.lifecycle.engagement_id()
    }

    pub(crate) fn state(&self) -> EngagementState {
        self.lifecycle.state()
    }

    /// Creation order, used to break ties between engagements created in the same instant.
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Overwrite the recorded creation time.
    #[cfg(test)]
    pub(crate) fn set_created_at(&mut self, at: SystemTime) {
        self.created_at = at;
    }

    pub(crate) fn to_summary(&self) -> EngagementSummary {
        EngagementSummary {
            id: self.id().to_string(),
            state: self.state(),
            config_source: self.config_source.clone(),
            agent_count: self.counters.agents,
            finding_count: self.counters.findings,
            created_at_epoch_ms: epoch_ms(self.created_at),
            state_since_epoch_ms: epoch_ms(self.lifecycle.state_since()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn name_from_config_stem() {
        let name = derive_name(Path::new("/etc/redline/Ministry.toml"), None).unwrap();
        assert_eq!(name, "ministry");
    }

    #[test]
    fn explicit_name_wins() {
        let name = derive_name(Path::new("/etc/x.toml"), Some("Acme Corp / Q3")).unwrap();
        assert_eq!(name, "acme-corp-q3");
    }

    #[test]
    fn sanitize_collapses_and_trims() {
        assert_eq!(sanitize_name("--a__b..c--").unwrap(), "a-b-c");
        assert_eq!(sanitize_name("../../etc/passwd").unwrap(), "etc-passwd");
        assert_eq!(sanitize_name("ünïcode9").unwrap(), "n-code9");
    }

    #[test]
    fn sanitize_rejects_empty_and_long() {
        assert!(matches!(
            sanitize_name("/// ..."),
            Err(RedlineError::InvalidName(_))
        ));
        assert!(sanitize_name(&"a".repeat(MAX_NAME_LEN)).is_ok());
        assert!(matches!(
            sanitize_name(&"a".repeat(MAX_NAME_LEN + 1)),
            Err(RedlineError::InvalidName(_))
        ));
    }

    #[test]
    fn id_format() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 7).unwrap();
        let id = generate_id("ministry", now);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 4, "{id}");
        assert_eq!(parts[0], "ministry");
        assert_eq!(parts[1], "20261018");
        assert_eq!(parts[2], "090507");
        assert_eq!(parts[3].len(), SUFFIX_BYTES * 2);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(is_safe_id(&id));
    }

    #[test]
    fn safe_id_charset() {
        assert!(is_safe_id("a-1"));
        assert!(!is_safe_id(""));
        assert!(!is_safe_id("-a"));
        assert!(!is_safe_id("a/b"));
        assert!(!is_safe_id("A"));
        assert!(!is_safe_id(".."));
    }

    #[test]
    fn summary_is_a_detached_copy() {
        let mut ctx = EngagementContext::new("e-1".to_string(), PathBuf::from("e.toml"), 0);
        let before = ctx.to_summary();
        ctx.lifecycle.start().unwrap();
        ctx.counters.agents = 3;
        assert_eq!(before.state, EngagementState::Initializing);
        assert_eq!(before.agent_count, 0);
        let after = ctx.to_summary();
        assert_eq!(after.state, EngagementState::Running);
        assert_eq!(after.agent_count, 3);
    }
}
