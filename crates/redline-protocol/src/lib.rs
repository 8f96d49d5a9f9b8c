pub mod paths;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Maximum size of a JSON-lines frame on the control socket (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Unique identifier for an engagement.
pub type EngagementId = String;

/// Parameter and data mappings carried by requests and responses.
pub type Params = Map<String, Value>;

// ---------------------------------------------------------------------------
// Command vocabulary
// ---------------------------------------------------------------------------

/// The closed set of commands the daemon understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    SessionsList,
    EngagementStart,
    EngagementAttach,
    EngagementDetach,
    EngagementPause,
    EngagementResume,
    EngagementStop,
    EngagementComplete,
    EngagementRemove,
    DaemonStop,
    DaemonStatus,
    DaemonConfigReload,
    DaemonKill,
    DaemonKillReset,
}

impl Command {
    pub const ALL: [Command; 14] = [
        Command::SessionsList,
        Command::EngagementStart,
        Command::EngagementAttach,
        Command::EngagementDetach,
        Command::EngagementPause,
        Command::EngagementResume,
        Command::EngagementStop,
        Command::EngagementComplete,
        Command::EngagementRemove,
        Command::DaemonStop,
        Command::DaemonStatus,
        Command::DaemonConfigReload,
        Command::DaemonKill,
        Command::DaemonKillReset,
    ];

    /// Wire name of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::SessionsList => "sessions.list",
            Command::EngagementStart => "engagement.start",
            Command::EngagementAttach => "engagement.attach",
            Command::EngagementDetach => "engagement.detach",
            Command::EngagementPause => "engagement.pause",
            Command::EngagementResume => "engagement.resume",
            Command::EngagementStop => "engagement.stop",
            Command::EngagementComplete => "engagement.complete",
            Command::EngagementRemove => "engagement.remove",
            Command::DaemonStop => "daemon.stop",
            Command::DaemonStatus => "daemon.status",
            Command::DaemonConfigReload => "daemon.config.reload",
            Command::DaemonKill => "daemon.kill",
            Command::DaemonKillReset => "daemon.kill.reset",
        }
    }

    /// Look up a command by wire name. Returns `None` for anything outside the vocabulary.
    pub fn parse(raw: &str) -> Option<Command> {
        Command::ALL.into_iter().find(|c| c.as_str() == raw)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::parse(s).ok_or_else(|| ProtocolError::UnknownCommand {
            command: s.to_string(),
            id: None,
        })
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Command::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown command: {raw}")))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures at the protocol boundary, before any business logic runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message is not valid UTF-8")]
    NotUtf8,

    #[error("message exceeds {MAX_LINE_BYTES} bytes ({len} bytes)")]
    LineTooLong { len: usize },

    #[error("malformed message: {reason}")]
    Malformed { reason: String, id: Option<String> },

    #[error("unknown command: {command}")]
    UnknownCommand { command: String, id: Option<String> },

    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Correlation id recovered from the offending message, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ProtocolError::Malformed { id, .. } | ProtocolError::UnknownCommand { id, .. } => {
                id.as_deref()
            }
            _ => None,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::UnknownCommand { .. } => ErrorCode::UnknownCommand,
            ProtocolError::Encode(_) => ErrorCode::ServerError,
            _ => ErrorCode::MalformedMessage,
        }
    }
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedMessage,
    UnknownCommand,
    InvalidParams,
    NotFound,
    InvalidTransition,
    CapacityExceeded,
    StillActive,
    NotAttached,
    Halted,
    ShuttingDown,
    ServerError,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request sent from a client to the daemon over the control socket.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub command: Command,
    pub params: Params,
    pub id: String,
}

#[derive(Deserialize)]
struct RawRequest {
    command: String,
    #[serde(default)]
    params: Option<Params>,
    id: String,
}

impl Request {
    /// Build a request for a command given by wire name. Fails for unknown commands.
    pub fn new(command: &str) -> Result<Self, ProtocolError> {
        Ok(Self::for_command(command.parse()?))
    }

    /// Build a request with a fresh correlation id.
    pub fn for_command(command: Command) -> Self {
        Self {
            command,
            params: Params::new(),
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Serialize without the trailing newline (for line-framed writers).
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Serialize as one newline-terminated record.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut line = self.to_line()?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
        Self::decode(line)
    }

    /// Decode one record. Unknown commands are rejected here, before dispatch.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = check_line(line)?;
        let raw: RawRequest = serde_json::from_str(line).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
            id: salvage_id(line),
        })?;
        let Some(command) = Command::parse(&raw.command) else {
            return Err(ProtocolError::UnknownCommand {
                command: raw.command,
                id: Some(raw.id),
            });
        };
        Ok(Self {
            command,
            params: raw.params.unwrap_or_default(),
            id: raw.id,
        })
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
}

/// Daemon-to-client reply. `id` always echoes the request's id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub data: Option<Params>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub id: String,
}

impl Response {
    pub fn ok(id: impl Into<String>, data: Option<Params>) -> Self {
        Self {
            status: Status::Ok,
            data,
            error: None,
            code: None,
            id: id.into(),
        }
    }

    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            data: None,
            error: Some(message.into()),
            code: Some(code),
            id: id.into(),
        }
    }

    /// Error response carrying structured context (ids, states, counts) in `data`.
    pub fn error_with_context(
        id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        context: Option<Params>,
    ) -> Self {
        Self {
            data: context,
            ..Self::error(id, code, message)
        }
    }

    /// Reply to a request that failed protocol decoding.
    pub fn protocol_error(err: &ProtocolError) -> Self {
        Self::error(
            err.correlation_id().unwrap_or_default(),
            err.code(),
            err.to_string(),
        )
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut line = self.to_line()?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = check_line(line)?;
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
            id: salvage_id(line),
        })
    }
}

// ---------------------------------------------------------------------------
// Engagement data and notifications
// ---------------------------------------------------------------------------

/// Lifecycle state of an engagement.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngagementState {
    Initializing,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl EngagementState {
    /// Active engagements count against the capacity ceiling.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            EngagementState::Initializing | EngagementState::Running | EngagementState::Paused
        )
    }

    pub fn is_terminal(self) -> bool {
        self == EngagementState::Completed
    }

    pub fn label(self) -> &'static str {
        match self {
            EngagementState::Initializing => "INITIALIZING",
            EngagementState::Running => "RUNNING",
            EngagementState::Paused => "PAUSED",
            EngagementState::Stopped => "STOPPED",
            EngagementState::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for EngagementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Read-only projection of an engagement returned by list/status commands.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EngagementSummary {
    pub id: EngagementId,
    pub state: EngagementState,
    pub config_source: PathBuf,
    pub agent_count: u64,
    pub finding_count: u64,
    pub created_at_epoch_ms: u64,
    pub state_since_epoch_ms: u64,
}

/// Events pushed to attached clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    StateChanged {
        engagement_id: EngagementId,
        from: EngagementState,
        to: EngagementState,
        at_epoch_ms: u64,
    },
    Shutdown {
        reason: String,
        countdown_secs: u64,
    },
    Halted {
        reason: String,
        actor: String,
    },
}

/// Any line the daemon writes: a correlated response or an unsolicited notification.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(Response),
    Notification(Notification),
}

impl ServerMessage {
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = check_line(line)?;
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
            id: salvage_id(line),
        })
    }
}

impl From<Response> for ServerMessage {
    fn from(resp: Response) -> Self {
        ServerMessage::Response(resp)
    }
}

impl From<Notification> for ServerMessage {
    fn from(n: Notification) -> Self {
        ServerMessage::Notification(n)
    }
}

fn check_line(line: &str) -> Result<&str, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::LineTooLong { len: line.len() });
    }
    Ok(line)
}

/// Best-effort recovery of a correlation id from a record that failed strict decoding.
fn salvage_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}
