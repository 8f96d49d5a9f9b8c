pub mod collaborators;
pub mod engagement;
pub mod error;
pub mod kill_switch;
pub mod lifecycle;
pub mod session;
pub mod signing;
pub mod subscriptions;

pub use collaborators::{
    CheckpointStore, CollaboratorError, ContainerCliRuntime, CoordinationBus, FsCheckpointStore,
    LocalBus, NoSandboxRuntime, SandboxHandle, SandboxRuntime,
};
pub use engagement::{EngagementCounters, derive_name, generate_id, is_safe_id, sanitize_name};
pub use error::RedlineError;
pub use kill_switch::{
    HaltCheck, Halted, KillPath, KillSwitch, KillSwitchConfig, KillSwitchResult, PathOutcome,
    ProcessSignaller,
};
pub use lifecycle::{Action, InvalidTransition, Lifecycle, Transition};
pub use session::{SessionLimits, SessionManager, ShutdownReport};
pub use signing::{HaltAnnouncement, HaltSigner, SignedPayload};
pub use subscriptions::{Callback, SubscriberId, SubscriptionRegistry, channel_callback};
