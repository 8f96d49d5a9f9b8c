use serde_json::json;
use thiserror::Error;

use redline_protocol::{EngagementId, EngagementState, ErrorCode, Params};

use crate::kill_switch::Halted;
use crate::lifecycle::InvalidTransition;

#[derive(Error, Debug)]
pub enum RedlineError {
    #[error("engagement not found: {0}")]
    NotFound(EngagementId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("capacity exceeded: {active} of {max} active engagements")]
    CapacityExceeded { active: usize, max: usize },

    #[error("invalid engagement name: {0}")]
    InvalidName(String),

    #[error("engagement {id} is {state} and cannot be removed while active")]
    StillActive {
        id: EngagementId,
        state: EngagementState,
    },

    #[error(transparent)]
    Halted(#[from] Halted),

    #[error("daemon is shutting down")]
    ShuttingDown,

    #[error("could not allocate a unique id for {0}")]
    IdExhausted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RedlineError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            RedlineError::NotFound(_) => (ErrorCode::NotFound, self.to_string()),
            RedlineError::InvalidTransition(_) => (ErrorCode::InvalidTransition, self.to_string()),
            RedlineError::CapacityExceeded { .. } => (ErrorCode::CapacityExceeded, self.to_string()),
            RedlineError::InvalidName(_) => (ErrorCode::InvalidParams, self.to_string()),
            RedlineError::StillActive { .. } => (ErrorCode::StillActive, self.to_string()),
            RedlineError::Halted(_) => (ErrorCode::Halted, self.to_string()),
            RedlineError::ShuttingDown => (ErrorCode::ShuttingDown, self.to_string()),
            RedlineError::IdExhausted(_) => (ErrorCode::ServerError, self.to_string()),
            RedlineError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }

    /// Structured context for the error response's `data` mapping.
    pub fn context(&self) -> Option<Params> {
        let value = match self {
            RedlineError::NotFound(id) => json!({ "engagement_id": id }),
            RedlineError::InvalidTransition(e) => json!({
                "engagement_id": e.engagement_id,
                "action": e.action.as_str(),
                "current": e.from,
                "requested": e.to,
            }),
            RedlineError::CapacityExceeded { active, max } => json!({
                "active": active,
                "max_engagements": max,
            }),
            RedlineError::StillActive { id, state } => json!({
                "engagement_id": id,
                "current": state,
            }),
            RedlineError::Halted(h) => json!({ "reason": h.reason }),
            _ => return None,
        };
        match value {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        }
    }
}
