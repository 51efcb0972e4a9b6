use std::{fmt, str::FromStr};

/// Persisted lifecycle state of a bot.
///
/// `Draft` and `Created` are only ever written by the API layer; this crate
/// owns every move among `Starting`, `Running`, `Stopped` and `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Draft,
    Created,
    Starting,
    Running,
    Stopped,
    Error,
}

impl BotStatus {
    pub const ALL: [BotStatus; 6] = [
        BotStatus::Draft,
        BotStatus::Created,
        BotStatus::Starting,
        BotStatus::Running,
        BotStatus::Stopped,
        BotStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BotStatus::Draft => "draft",
            BotStatus::Created => "created",
            BotStatus::Starting => "starting",
            BotStatus::Running => "running",
            BotStatus::Stopped => "stopped",
            BotStatus::Error => "error",
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError(pub String);

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status: {:?}", self.0)
    }
}

impl std::error::Error for ParseStatusError {}

impl FromStr for BotStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(BotStatus::Draft),
            "created" => Ok(BotStatus::Created),
            "starting" => Ok(BotStatus::Starting),
            "running" => Ok(BotStatus::Running),
            "stopped" => Ok(BotStatus::Stopped),
            "error" => Ok(BotStatus::Error),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "healthy" => Ok(HealthStatus::Healthy),
            "unhealthy" => Ok(HealthStatus::Unhealthy),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// What to do with a bot that sat in `starting` past the stuck deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StuckPolicy {
    /// Assume the container came up and the readiness signal was lost.
    Running,
    /// Treat the start as failed.
    Error,
}

impl StuckPolicy {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .as_deref()
        {
            Some("running") | Some("assume-ready") | Some("assume_ready") => StuckPolicy::Running,
            _ => StuckPolicy::Error,
        }
    }

    pub fn target(self) -> BotStatus {
        match self {
            StuckPolicy::Running => BotStatus::Running,
            StuckPolicy::Error => BotStatus::Error,
        }
    }
}

/// Signals that drive the core-owned part of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartRequested,
    ReadinessDetected,
    ReadinessTimeout,
    StopRequested,
    UnexpectedExit,
    StuckDeadline(StuckPolicy),
}

/// Computes the next status for `trigger`, or `None` when nothing changes.
///
/// `None` covers both "already there" and "not allowed from here"; callers
/// never write a status this function did not return.
pub fn transition(current: BotStatus, trigger: Trigger) -> Option<BotStatus> {
    use BotStatus::*;

    let target = match (trigger, current) {
        (Trigger::StartRequested, Created | Stopped | Error) => Starting,
        (Trigger::ReadinessDetected | Trigger::ReadinessTimeout, Starting) => Running,
        (Trigger::StopRequested, Starting | Running) => Stopped,
        (Trigger::UnexpectedExit, Running) => Error,
        (Trigger::StuckDeadline(policy), Starting) => policy.target(),
        _ => return None,
    };

    changed(current, target)
}

pub(crate) fn changed(current: BotStatus, target: BotStatus) -> Option<BotStatus> {
    if current == target { None } else { Some(target) }
}
