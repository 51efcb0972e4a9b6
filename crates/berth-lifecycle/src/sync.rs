use crate::status::{BotStatus, changed};

/// Runtime view of the container matched to a bot during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LiveContainer {
    pub container_ref: String,
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Corrections reconciliation should write for one bot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub status: Option<BotStatus>,
    /// `Some(None)` clears the stored container ref, `Some(Some(r))` replaces it.
    pub container_ref: Option<Option<String>>,
}

impl SyncOutcome {
    pub fn is_noop(&self) -> bool {
        self.status.is_none() && self.container_ref.is_none()
    }
}

/// Diffs a persisted bot against what the runtime reports.
///
/// - no container while `running` -> `stopped`, ref cleared
/// - container exited while `running` -> `stopped` on a clean exit, `error` otherwise
/// - container running while not `running` -> `running`
///
/// Every other combination leaves the status alone. A live container whose
/// ref differs from the stored one is adopted.
pub fn sync_bot_status(
    current: BotStatus,
    stored_ref: Option<&str>,
    live: Option<&LiveContainer>,
) -> SyncOutcome {
    let Some(live) = live else {
        if current == BotStatus::Running {
            return SyncOutcome {
                status: Some(BotStatus::Stopped),
                container_ref: stored_ref.map(|_| None),
            };
        }
        return SyncOutcome::default();
    };

    let status = if live.running {
        changed(current, BotStatus::Running)
    } else if current == BotStatus::Running {
        match live.exit_code {
            Some(0) | None => Some(BotStatus::Stopped),
            Some(_) => Some(BotStatus::Error),
        }
    } else {
        None
    };

    let container_ref = if stored_ref != Some(live.container_ref.as_str()) {
        Some(Some(live.container_ref.clone()))
    } else {
        None
    };

    SyncOutcome {
        status,
        container_ref,
    }
}
