//! External collaborators of the reconciliation core: the container runtime
//! and the per-bot workspace/secret filesystem.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use berth_lifecycle::IsolationKey;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

pub mod docker;
mod error;
pub mod workspace;

pub use docker::{DockerConfig, DockerRuntime};
pub use error::RuntimeError;
pub use workspace::{FsWorkspaces, WorkspacePaths, WorkspaceStore};

/// Label marking containers owned by this system.
pub const LABEL_MANAGED_BY: &str = "berth.managed_by";
pub const MANAGED_BY_VALUE: &str = "berth";
pub const LABEL_ISOLATION_KEY: &str = "berth.isolation_key";
pub const LABEL_BOT_ID: &str = "berth.bot_id";
pub const LABEL_TENANT_ID: &str = "berth.tenant_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    /// Host port published on loopback, mapped to the same container port.
    pub gateway_port: Option<u16>,
    pub memory_bytes: Option<u64>,
    pub pids_limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub container_ref: String,
    pub name: String,
    pub isolation_key: Option<IsolationKey>,
    pub running: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub tail: usize,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub labels: Vec<(String, String)>,
    pub actions: Vec<String>,
}

impl EventFilter {
    /// Container lifecycle actions for containers labelled as ours.
    pub fn managed_lifecycle() -> Self {
        Self {
            labels: vec![(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string())],
            actions: ["start", "restart", "stop", "die", "kill", "oom"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Raw newline-delimited JSON chunks from the runtime's event feed. Chunk
/// boundaries are arbitrary.
pub type EventStream = BoxStream<'static, Result<Vec<u8>, RuntimeError>>;

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<String, RuntimeError>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn start(&self, container_ref: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, container_ref: &str, timeout: Duration) -> Result<(), RuntimeError>;
    /// Force-removes a container. Removing a missing container succeeds.
    async fn remove(&self, container_ref: &str) -> Result<(), RuntimeError>;
    /// `None` when the container no longer exists.
    async fn get_status(&self, container_ref: &str) -> Result<Option<ContainerState>, RuntimeError>;
    async fn get_logs(&self, container_ref: &str, query: &LogQuery) -> Result<String, RuntimeError>;
    async fn subscribe_events(&self, filter: &EventFilter) -> Result<EventStream, RuntimeError>;
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;
}
