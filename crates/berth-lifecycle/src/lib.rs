//! Pure lifecycle rules for bot containers.
//!
//! Every component that mutates a bot's persisted status goes through the
//! functions in this crate. They take the *current* status as input and
//! return `Some(next)` only when the status actually changes, so callers can
//! apply them repeatedly and in any order without flapping.

pub mod event;
pub mod health;
pub mod isolation;
pub mod status;
pub mod sync;

pub use event::{ContainerAction, RuntimeEvent, map_event_to_status};
pub use health::FailureStreaks;
pub use isolation::{IsolationKey, derive_isolation_key};
pub use status::{BotStatus, HealthStatus, ParseStatusError, StuckPolicy, Trigger, transition};
pub use sync::{LiveContainer, SyncOutcome, sync_bot_status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct BotId(pub uuid::Uuid);

impl BotId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for BotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
