use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::status::{BotStatus, changed};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Restart,
    Stop,
    Die,
    Kill,
    Oom,
    Other(String),
}

impl ContainerAction {
    /// Maps a runtime action name. Docker suffixes some actions with a
    /// detail (`exec_start: sh -c ...`, `health_status: healthy`); only the
    /// part before the colon is significant.
    pub fn parse(raw: &str) -> Self {
        let head = raw.split(':').next().unwrap_or_default().trim();
        match head.to_ascii_lowercase().as_str() {
            "start" => ContainerAction::Start,
            "restart" => ContainerAction::Restart,
            "stop" => ContainerAction::Stop,
            "die" => ContainerAction::Die,
            "kill" => ContainerAction::Kill,
            "oom" => ContainerAction::Oom,
            _ => ContainerAction::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Restart => "restart",
            ContainerAction::Stop => "stop",
            ContainerAction::Die => "die",
            ContainerAction::Kill => "kill",
            ContainerAction::Oom => "oom",
            ContainerAction::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RuntimeEvent {
    pub action: ContainerAction,
    pub container_ref: String,
    pub attributes: BTreeMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl RuntimeEvent {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Status change implied by a container event.
///
/// While a bot is `starting` or has an active readiness watch, bare
/// start/stop/die/kill events are restart churn and are ignored; `oom` is
/// always fatal.
pub fn map_event_to_status(
    action: &ContainerAction,
    current: BotStatus,
    has_active_monitor: bool,
) -> Option<BotStatus> {
    let guarded = current == BotStatus::Starting || has_active_monitor;

    let target = match action {
        ContainerAction::Start if guarded => return None,
        ContainerAction::Start => BotStatus::Running,
        ContainerAction::Restart => BotStatus::Starting,
        ContainerAction::Stop if guarded => return None,
        ContainerAction::Stop => BotStatus::Stopped,
        ContainerAction::Die | ContainerAction::Kill if guarded => return None,
        ContainerAction::Die | ContainerAction::Kill => {
            if current == BotStatus::Stopped {
                return None;
            }
            BotStatus::Error
        }
        ContainerAction::Oom => BotStatus::Error,
        ContainerAction::Other(_) => return None,
    };

    changed(current, target)
}
