use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use berth_lifecycle::StuckPolicy;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8090";
pub const DEFAULT_BOT_IMAGE: &str = "ghcr.io/berth/bot-runtime:latest";

/// Everything the control plane reads from the environment.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub data_root: PathBuf,
    pub docker_bin: String,
    pub runtime_timeout: Duration,
    pub bot_image: String,
    pub events: EventsConfig,
    pub watchdog: WatchdogConfig,
    pub health: HealthConfig,
    pub reconcile: ReconcileConfig,
    pub notify_url: Option<String>,
    pub proxy_url: Option<String>,
    pub proxy_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventsConfig {
    pub reconnect_delay: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub log_tail: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2_000),
            timeout: Duration::from_millis(60_000),
            log_tail: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub probe_host: String,
    pub probe_path: String,
    pub stuck_interval: Duration,
    pub stuck_deadline: Duration,
    pub stuck_policy: StuckPolicy,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(30_000),
            probe_timeout: Duration::from_millis(5_000),
            failure_threshold: 3,
            probe_host: "127.0.0.1".to_string(),
            probe_path: "/health".to_string(),
            stuck_interval: Duration::from_millis(60_000),
            stuck_deadline: Duration::from_millis(300_000),
            stuck_policy: StuckPolicy::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileConfig {
    /// `None` reconciles once at boot only.
    pub interval: Option<Duration>,
    pub cleanup_orphans_on_boot: bool,
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env(&lookup);

        let database_url = env
            .string("DATABASE_URL")
            .context("DATABASE_URL is required")?;

        let listen_raw = env
            .string("BERTH_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr: SocketAddr = listen_raw
            .parse()
            .with_context(|| format!("invalid BERTH_LISTEN_ADDR: {listen_raw}"))?;

        let events = EventsConfig {
            reconnect_delay: env.millis("BERTH_EVENTS_RECONNECT_MS", 100, 300_000, 5_000),
        };

        let watchdog = WatchdogConfig {
            poll_interval: env.millis("BERTH_WATCHDOG_POLL_MS", 100, 60_000, 2_000),
            timeout: env.millis("BERTH_WATCHDOG_TIMEOUT_MS", 1_000, 3_600_000, 60_000),
            log_tail: env
                .u64("BERTH_WATCHDOG_LOG_TAIL")
                .map(|v| v.clamp(1, 10_000) as usize)
                .unwrap_or(200),
        };

        let defaults = HealthConfig::default();
        let health = HealthConfig {
            interval: env.millis("BERTH_HEALTH_INTERVAL_MS", 1_000, 3_600_000, 30_000),
            probe_timeout: env.millis("BERTH_HEALTH_TIMEOUT_MS", 100, 60_000, 5_000),
            failure_threshold: env
                .u64("BERTH_HEALTH_FAILURE_THRESHOLD")
                .map(|v| v.clamp(1, 100) as u32)
                .unwrap_or(defaults.failure_threshold),
            probe_host: env.string("BERTH_HEALTH_PROBE_HOST").unwrap_or(defaults.probe_host),
            probe_path: env
                .string("BERTH_HEALTH_PROBE_PATH")
                .map(|p| if p.starts_with('/') { p } else { format!("/{p}") })
                .unwrap_or(defaults.probe_path),
            stuck_interval: env.millis("BERTH_STUCK_INTERVAL_MS", 1_000, 3_600_000, 60_000),
            stuck_deadline: env.millis("BERTH_STUCK_DEADLINE_MS", 10_000, 86_400_000, 300_000),
            stuck_policy: StuckPolicy::parse(env.string("BERTH_STUCK_POLICY").as_deref()),
        };

        let reconcile = ReconcileConfig {
            interval: env
                .u64("BERTH_RECONCILE_INTERVAL_MS")
                .filter(|v| *v > 0)
                .map(|v| Duration::from_millis(v.clamp(10_000, 86_400_000))),
            cleanup_orphans_on_boot: env.bool("BERTH_CLEANUP_ORPHANS_ON_BOOT"),
        };

        Ok(Self {
            database_url,
            listen_addr,
            data_root: env
                .string("BERTH_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            docker_bin: env
                .string("BERTH_DOCKER_BIN")
                .unwrap_or_else(|| "docker".to_string()),
            runtime_timeout: env.millis("BERTH_RUNTIME_TIMEOUT_MS", 1_000, 600_000, 15_000),
            bot_image: env
                .string("BERTH_BOT_IMAGE")
                .unwrap_or_else(|| DEFAULT_BOT_IMAGE.to_string()),
            events,
            watchdog,
            health,
            reconcile,
            notify_url: env.string("BERTH_NOTIFY_URL"),
            proxy_url: env.string("BERTH_PROXY_URL"),
            proxy_enabled: env.bool("BERTH_PROXY_ENABLED"),
        })
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn u64(&self, name: &str) -> Option<u64> {
        self.string(name).and_then(|v| v.parse::<u64>().ok())
    }

    fn bool(&self, name: &str) -> bool {
        self.string(name)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }

    fn millis(&self, name: &str, min: u64, max: u64, default: u64) -> Duration {
        Duration::from_millis(self.u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
    }
}
