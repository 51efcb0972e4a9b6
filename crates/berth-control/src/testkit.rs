//! In-memory collaborators for unit tests.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};

use berth_lifecycle::{BotId, BotStatus, HealthStatus, IsolationKey};
use berth_runtime::{
    ContainerRuntime, ContainerSpec, ContainerState, EventFilter, EventStream, LogQuery,
    ManagedContainer, RuntimeError, WorkspacePaths, WorkspaceStore,
};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    notify::Notifier,
    probe::HealthProbe,
    proxy::{ProxyRegistrar, ProxyToken},
    store::{BotPatch, BotRecord, BotStore},
};

pub(crate) fn bot(hostname: &str, status: BotStatus) -> BotRecord {
    BotRecord {
        id: BotId::new(),
        tenant_id: Uuid::new_v4(),
        hostname: hostname.to_string(),
        container_ref: None,
        status,
        health_status: HealthStatus::Healthy,
        last_health_check_at: None,
        gateway_port: None,
        image: None,
        updated_at: Utc::now(),
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    bots: Mutex<HashMap<BotId, BotRecord>>,
    fail: Mutex<bool>,
    fail_bots: Mutex<HashSet<BotId>>,
}

impl MemoryStore {
    pub fn insert(&self, bot: BotRecord) {
        self.bots.lock().unwrap().insert(bot.id, bot);
    }

    pub fn bot(&self, id: BotId) -> BotRecord {
        self.bots.lock().unwrap().get(&id).cloned().expect("bot in store")
    }

    pub fn status(&self, id: BotId) -> BotStatus {
        self.bot(id).status
    }

    pub fn set_status(&self, id: BotId, status: BotStatus) {
        if let Some(b) = self.bots.lock().unwrap().get_mut(&id) {
            b.status = status;
        }
    }

    pub fn remove(&self, id: BotId) {
        self.bots.lock().unwrap().remove(&id);
    }

    pub fn fail_all(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    /// Reads and writes of this one bot fail; listings still succeed.
    pub fn fail_bot(&self, id: BotId) {
        self.fail_bots.lock().unwrap().insert(id);
    }

    fn check(&self) -> anyhow::Result<()> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("store offline");
        }
        Ok(())
    }

    fn check_bot(&self, id: BotId) -> anyhow::Result<()> {
        self.check()?;
        if self.fail_bots.lock().unwrap().contains(&id) {
            anyhow::bail!("row {id} locked");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BotStore for MemoryStore {
    async fn get(&self, id: BotId) -> anyhow::Result<Option<BotRecord>> {
        self.check_bot(id)?;
        Ok(self.bots.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_container_ref(&self, container_ref: &str) -> anyhow::Result<Option<BotRecord>> {
        self.check()?;
        Ok(self
            .bots
            .lock()
            .unwrap()
            .values()
            .find(|b| b.container_ref.as_deref() == Some(container_ref))
            .cloned())
    }

    async fn list_active(&self) -> anyhow::Result<Vec<BotRecord>> {
        self.check()?;
        let mut all: Vec<_> = self.bots.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(all)
    }

    async fn list_by_status(&self, status: BotStatus) -> anyhow::Result<Vec<BotRecord>> {
        Ok(self
            .list_active()
            .await?
            .into_iter()
            .filter(|b| b.status == status)
            .collect())
    }

    async fn update(&self, id: BotId, patch: BotPatch) -> anyhow::Result<bool> {
        self.check_bot(id)?;
        let mut bots = self.bots.lock().unwrap();
        let Some(b) = bots.get_mut(&id) else {
            return Ok(false);
        };
        if patch.expected_status.is_some_and(|s| s != b.status) {
            return Ok(false);
        }
        if let Some(s) = patch.status {
            b.status = s;
            b.updated_at = Utc::now();
        }
        if let Some(r) = patch.container_ref {
            b.container_ref = r;
        }
        if let Some(h) = patch.health_status {
            b.health_status = h;
        }
        if let Some(at) = patch.last_health_check_at {
            b.last_health_check_at = Some(at);
        }
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FakeContainer {
    pub name: String,
    pub key: Option<IsolationKey>,
    pub running: bool,
    pub exit_code: Option<i64>,
}

pub(crate) type StreamItem = Result<Vec<u8>, RuntimeError>;

struct RuntimeState {
    reachable: bool,
    containers: BTreeMap<String, FakeContainer>,
    logs: HashMap<String, String>,
    fail_logs: bool,
    log_delay: Option<Duration>,
    log_queries: Vec<LogQuery>,
    streams: VecDeque<EventStream>,
    subscribe_calls: usize,
    created: Vec<ContainerSpec>,
    started: Vec<String>,
    stopped: Vec<String>,
    removed: Vec<String>,
    fail_create: bool,
    fail_start: bool,
    fail_remove: HashSet<String>,
    fail_status: HashSet<String>,
    next_id: u64,
}

pub(crate) struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                reachable: true,
                containers: BTreeMap::new(),
                logs: HashMap::new(),
                fail_logs: false,
                log_delay: None,
                log_queries: Vec::new(),
                streams: VecDeque::new(),
                subscribe_calls: 0,
                created: Vec::new(),
                started: Vec::new(),
                stopped: Vec::new(),
                removed: Vec::new(),
                fail_create: false,
                fail_start: false,
                fail_remove: HashSet::new(),
                fail_status: HashSet::new(),
                next_id: 1,
            }),
        }
    }
}

impl FakeRuntime {
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    pub fn add_container(&self, container_ref: &str, key: Option<&IsolationKey>, running: bool, exit_code: Option<i64>) {
        let name = key
            .map(IsolationKey::container_name)
            .unwrap_or_else(|| format!("stray-{container_ref}"));
        self.state.lock().unwrap().containers.insert(
            container_ref.to_string(),
            FakeContainer {
                name,
                key: key.cloned(),
                running,
                exit_code,
            },
        );
    }

    pub fn container(&self, container_ref: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(container_ref).cloned()
    }

    pub fn set_logs(&self, container_ref: &str, logs: &str) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(container_ref.to_string(), logs.to_string());
    }

    pub fn fail_logs(&self, fail: bool) {
        self.state.lock().unwrap().fail_logs = fail;
    }

    /// Every log fetch takes this long before answering.
    pub fn delay_logs(&self, delay: Duration) {
        self.state.lock().unwrap().log_delay = Some(delay);
    }

    pub fn log_queries(&self) -> Vec<LogQuery> {
        self.state.lock().unwrap().log_queries.clone()
    }

    pub fn log_calls(&self) -> usize {
        self.state.lock().unwrap().log_queries.len()
    }

    pub fn push_stream(&self, items: Vec<StreamItem>) {
        let stream = futures_util::stream::iter(items).boxed();
        self.state.lock().unwrap().streams.push_back(stream);
    }

    /// A stream that stays open until the sender is dropped.
    pub fn push_channel(&self) -> mpsc::UnboundedSender<StreamItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        self.state.lock().unwrap().streams.push_back(stream);
        tx
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().unwrap().subscribe_calls
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    pub fn fail_remove(&self, container_ref: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_remove
            .insert(container_ref.to_string());
    }

    pub fn fail_status(&self, container_ref: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_status
            .insert(container_ref.to_string());
    }

    fn reachable(&self) -> Result<(), RuntimeError> {
        if self.state.lock().unwrap().reachable {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable("daemon down".to_string()))
        }
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<String, RuntimeError> {
        self.reachable()?;
        Ok("fake".to_string())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.reachable()?;
        let mut st = self.state.lock().unwrap();
        if st.fail_create {
            return Err(RuntimeError::Command {
                op: "create".to_string(),
                code: Some(125),
                stderr: "image not found".to_string(),
            });
        }
        let id = format!("ctr-{}", st.next_id);
        st.next_id += 1;
        st.created.push(spec.clone());
        st.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                key: spec
                    .labels
                    .get(berth_runtime::LABEL_ISOLATION_KEY)
                    .map(IsolationKey::from_raw),
                running: false,
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_ref: &str) -> Result<(), RuntimeError> {
        self.reachable()?;
        let mut st = self.state.lock().unwrap();
        if st.fail_start {
            return Err(RuntimeError::Command {
                op: "start".to_string(),
                code: Some(1),
                stderr: "port is already allocated".to_string(),
            });
        }
        let Some(c) = st.containers.get_mut(container_ref) else {
            return Err(RuntimeError::NotFound(container_ref.to_string()));
        };
        c.running = true;
        st.started.push(container_ref.to_string());
        Ok(())
    }

    async fn stop(&self, container_ref: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        self.reachable()?;
        let mut st = self.state.lock().unwrap();
        let Some(c) = st.containers.get_mut(container_ref) else {
            return Err(RuntimeError::NotFound(container_ref.to_string()));
        };
        c.running = false;
        c.exit_code = Some(0);
        st.stopped.push(container_ref.to_string());
        Ok(())
    }

    async fn remove(&self, container_ref: &str) -> Result<(), RuntimeError> {
        self.reachable()?;
        let mut st = self.state.lock().unwrap();
        if st.fail_remove.contains(container_ref) {
            return Err(RuntimeError::Command {
                op: "rm".to_string(),
                code: Some(1),
                stderr: "removal in progress".to_string(),
            });
        }
        st.removed.push(container_ref.to_string());
        let by_name = st
            .containers
            .iter()
            .find(|(_, c)| c.name == container_ref)
            .map(|(id, _)| id.clone());
        st.containers.remove(container_ref);
        if let Some(id) = by_name {
            st.containers.remove(&id);
        }
        Ok(())
    }

    async fn get_status(&self, container_ref: &str) -> Result<Option<ContainerState>, RuntimeError> {
        self.reachable()?;
        let st = self.state.lock().unwrap();
        if st.fail_status.contains(container_ref) {
            return Err(RuntimeError::Command {
                op: "inspect".to_string(),
                code: Some(1),
                stderr: "context deadline exceeded".to_string(),
            });
        }
        Ok(st
            .containers
            .get(container_ref)
            .map(|c| ContainerState {
                running: c.running,
                exit_code: if c.running { None } else { c.exit_code },
            }))
    }

    async fn get_logs(&self, container_ref: &str, query: &LogQuery) -> Result<String, RuntimeError> {
        let delay = {
            let mut st = self.state.lock().unwrap();
            st.log_queries.push(query.clone());
            st.log_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let st = self.state.lock().unwrap();
        if st.fail_logs || !st.reachable {
            return Err(RuntimeError::Unavailable("logs unavailable".to_string()));
        }
        Ok(st.logs.get(container_ref).cloned().unwrap_or_default())
    }

    async fn subscribe_events(&self, _filter: &EventFilter) -> Result<EventStream, RuntimeError> {
        self.reachable()?;
        let mut st = self.state.lock().unwrap();
        st.subscribe_calls += 1;
        st.streams
            .pop_front()
            .ok_or_else(|| RuntimeError::Unavailable("no event stream".to_string()))
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        self.reachable()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .iter()
            .map(|(id, c)| ManagedContainer {
                container_ref: id.clone(),
                name: c.name.clone(),
                isolation_key: c.key.clone(),
                running: c.running,
            })
            .collect())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<(String, String, Value)>>,
}

impl RecordingNotifier {
    pub fn count(&self, event: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e, _)| e == event)
            .count()
    }

    pub fn last_payload(&self) -> Value {
        self.sent
            .lock()
            .unwrap()
            .last()
            .map(|(_, _, p)| p.clone())
            .unwrap_or(Value::Null)
    }

    pub fn payloads(&self, event: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e, _)| e == event)
            .map(|(_, _, p)| p.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, tenant_id: &str, event: &str, payload: Value) {
        self.sent
            .lock()
            .unwrap()
            .push((tenant_id.to_string(), event.to_string(), payload));
    }
}

pub(crate) struct FakeProbe {
    default_ok: Mutex<bool>,
    scripted: Mutex<HashMap<String, VecDeque<bool>>>,
    calls: Mutex<Vec<String>>,
    hang: Mutex<bool>,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            default_ok: Mutex::new(true),
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            hang: Mutex::new(false),
        }
    }
}

impl FakeProbe {
    pub fn set_default(&self, ok: bool) {
        *self.default_ok.lock().unwrap() = ok;
    }

    pub fn script(&self, endpoint: &str, results: &[bool]) {
        self.scripted
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), results.iter().copied().collect());
    }

    pub fn hang(&self, hang: bool) {
        *self.hang.lock().unwrap() = hang;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, endpoint: &str, _timeout: Duration) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(endpoint.to_string());
        let hang = *self.hang.lock().unwrap();
        if hang {
            std::future::pending::<()>().await;
        }
        let ok = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front)
            .unwrap_or(*self.default_ok.lock().unwrap());
        if ok {
            Ok(())
        } else {
            anyhow::bail!("connection refused")
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeWorkspaces {
    workspaces: Mutex<BTreeSet<IsolationKey>>,
    secrets: Mutex<BTreeSet<IsolationKey>>,
    fail_listing: Mutex<bool>,
    fail_delete: Mutex<HashSet<IsolationKey>>,
}

impl FakeWorkspaces {
    pub fn add_workspace(&self, key: &IsolationKey) {
        self.workspaces.lock().unwrap().insert(key.clone());
    }

    pub fn add_secrets(&self, key: &IsolationKey) {
        self.secrets.lock().unwrap().insert(key.clone());
    }

    pub fn workspaces(&self) -> Vec<IsolationKey> {
        self.workspaces.lock().unwrap().iter().cloned().collect()
    }

    pub fn secrets(&self) -> Vec<IsolationKey> {
        self.secrets.lock().unwrap().iter().cloned().collect()
    }

    pub fn fail_listing(&self, fail: bool) {
        *self.fail_listing.lock().unwrap() = fail;
    }

    pub fn fail_delete(&self, key: &IsolationKey) {
        self.fail_delete.lock().unwrap().insert(key.clone());
    }

    fn listing(&self, set: &Mutex<BTreeSet<IsolationKey>>) -> Result<Vec<IsolationKey>, RuntimeError> {
        if *self.fail_listing.lock().unwrap() {
            return Err(RuntimeError::Io(std::io::Error::other("disk offline")));
        }
        Ok(set.lock().unwrap().iter().cloned().collect())
    }

    fn delete(&self, set: &Mutex<BTreeSet<IsolationKey>>, key: &IsolationKey) -> Result<(), RuntimeError> {
        if self.fail_delete.lock().unwrap().contains(key) {
            return Err(RuntimeError::Io(std::io::Error::other("permission denied")));
        }
        set.lock().unwrap().remove(key);
        Ok(())
    }
}

#[async_trait::async_trait]
impl WorkspaceStore for FakeWorkspaces {
    async fn ensure(&self, key: &IsolationKey) -> Result<WorkspacePaths, RuntimeError> {
        self.add_workspace(key);
        self.add_secrets(key);
        let root = PathBuf::from("/srv/berth");
        Ok(WorkspacePaths {
            workspace: root.join("workspaces").join(key.as_str()),
            secrets: root.join("secrets").join(key.as_str()),
        })
    }

    async fn list_workspace_keys(&self) -> Result<Vec<IsolationKey>, RuntimeError> {
        self.listing(&self.workspaces)
    }

    async fn list_secret_keys(&self) -> Result<Vec<IsolationKey>, RuntimeError> {
        self.listing(&self.secrets)
    }

    async fn delete_workspace(&self, key: &IsolationKey) -> Result<(), RuntimeError> {
        self.delete(&self.workspaces, key)
    }

    async fn delete_secrets(&self, key: &IsolationKey) -> Result<(), RuntimeError> {
        self.delete(&self.secrets, key)
    }
}

pub(crate) struct FakeProxy {
    pub enabled: bool,
    pub fail: bool,
}

#[async_trait::async_trait]
impl ProxyRegistrar for FakeProxy {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn register(&self, bot: &BotRecord, _key: &IsolationKey) -> anyhow::Result<ProxyToken> {
        if self.fail {
            anyhow::bail!("proxy unreachable");
        }
        Ok(ProxyToken {
            token: format!("tok-{}", bot.id),
            proxy_url: "http://proxy.internal:8080".to_string(),
        })
    }
}
