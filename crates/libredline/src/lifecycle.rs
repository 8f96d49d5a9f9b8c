//! Per-engagement lifecycle state machine.
//!
//! ```text
//! INITIALIZING --start--> RUNNING --pause--> PAUSED
//!                         RUNNING <--resume-- PAUSED
//!              RUNNING | PAUSED --stop--> STOPPED --complete--> COMPLETED
//! ```
//!
//! The guarded action methods are the only way to change state. Listeners are
//! invoked synchronously after every successful transition; a listener that
//! returns an error is dropped and the remaining listeners still run.

use std::fmt;
use std::time::SystemTime;

use thiserror::Error;
use tracing::warn;

use redline_protocol::{EngagementId, EngagementState};

/// A requested lifecycle move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Start,
    Pause,
    Resume,
    Stop,
    Complete,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Start,
        Action::Pause,
        Action::Resume,
        Action::Stop,
        Action::Complete,
    ];

    /// State the engagement lands in when the action succeeds.
    pub fn target(self) -> EngagementState {
        match self {
            Action::Start | Action::Resume => EngagementState::Running,
            Action::Pause => EngagementState::Paused,
            Action::Stop => EngagementState::Stopped,
            Action::Complete => EngagementState::Completed,
        }
    }

    pub fn allowed_from(self, state: EngagementState) -> bool {
        use EngagementState::*;
        matches!(
            (self, state),
            (Action::Start, Initializing)
                | (Action::Pause, Running)
                | (Action::Resume, Paused)
                | (Action::Stop, Running | Paused)
                | (Action::Complete, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Stop => "stop",
            Action::Complete => "complete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {action} engagement {engagement_id}: invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub engagement_id: EngagementId,
    pub action: Action,
    pub from: EngagementState,
    pub to: EngagementState,
}

/// A completed state change, handed to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub engagement_id: EngagementId,
    pub action: Action,
    pub from: EngagementState,
    pub to: EngagementState,
    pub at: SystemTime,
}

pub type ListenerId = u64;

pub type TransitionListener = Box<dyn Fn(&Transition) -> anyhow::Result<()> + Send + Sync>;

pub struct Lifecycle {
    engagement_id: EngagementId,
    state: EngagementState,
    state_since: SystemTime,
    listeners: Vec<(ListenerId, TransitionListener)>,
    next_listener_id: ListenerId,
}

impl Lifecycle {
    pub fn new(engagement_id: impl Into<EngagementId>) -> Self {
        Self {
            engagement_id: engagement_id.into(),
            state: EngagementState::Initializing,
            state_since: SystemTime::now(),
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    pub fn engagement_id(&self) -> &str {
        &self.engagement_id
    }

    pub fn state(&self) -> EngagementState {
        self.state
    }

    /// When the current state was entered.
    pub fn state_since(&self) -> SystemTime {
        self.state_since
    }

    pub fn can_apply(&self, action: Action) -> bool {
        action.allowed_from(self.state)
    }

    pub fn start(&mut self) -> Result<EngagementState, InvalidTransition> {
        self.apply(Action::Start)
    }

    pub fn pause(&mut self) -> Result<EngagementState, InvalidTransition> {
        self.apply(Action::Pause)
    }

    pub fn resume(&mut self) -> Result<EngagementState, InvalidTransition> {
        self.apply(Action::Resume)
    }

    pub fn stop(&mut self) -> Result<EngagementState, InvalidTransition> {
        self.apply(Action::Stop)
    }

    pub fn complete(&mut self) -> Result<EngagementState, InvalidTransition> {
        self.apply(Action::Complete)
    }

    /// Validate `action` against the current state and perform it.
    pub fn apply(&mut self, action: Action) -> Result<EngagementState, InvalidTransition> {
        let from = self.state;
        let to = action.target();
        if !action.allowed_from(from) {
            return Err(InvalidTransition {
                engagement_id: self.engagement_id.clone(),
                action,
                from,
                to,
            });
        }

        self.state = to;
        self.state_since = SystemTime::now();

        let transition = Transition {
            engagement_id: self.engagement_id.clone(),
            action,
            from,
            to,
            at: self.state_since,
        };
        self.notify(&transition);
        Ok(to)
    }

    pub fn add_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&Transition) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn notify(&mut self, transition: &Transition) {
        self.listeners.retain(|(id, listener)| match listener(transition) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    engagement_id = %transition.engagement_id,
                    listener_id = id,
                    error = %err,
                    "transition listener failed, deregistering"
                );
                false
            }
        });
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("engagement_id", &self.engagement_id)
            .field("state", &self.state)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
