//! Start/stop/release entry points for a single bot.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use berth_lifecycle::{BotId, BotStatus, IsolationKey, Trigger, transition};
use berth_runtime::{
    ContainerRuntime, ContainerSpec, LABEL_BOT_ID, LABEL_ISOLATION_KEY, LABEL_MANAGED_BY,
    LABEL_TENANT_ID, MANAGED_BY_VALUE, Mount, RuntimeError, WorkspacePaths, WorkspaceStore,
};

use crate::{
    notify::{EVENT_BOT_STATUS, Notifier, status_payload},
    proxy::ProxyRegistrar,
    store::{BotPatch, BotRecord, BotStore},
    support::format_error_chain,
    watchdog::StartupWatchdog,
};

pub const WORKSPACE_MOUNT: &str = "/workspace";
pub const SECRETS_MOUNT: &str = "/run/secrets/berth";

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("bot {0} not found")]
    NotFound(BotId),
    #[error("bot {0} is still a draft")]
    Draft(BotId),
    #[error("bot {0} changed status concurrently")]
    Conflict(BotId),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RuntimeError> for LifecycleError {
    fn from(err: RuntimeError) -> Self {
        Self::Other(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// Credentials stay with the egress proxy; the bot only gets a token.
    Proxy,
    /// The secrets directory is mounted into the container.
    Direct,
}

impl NetworkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkMode::Proxy => "proxy",
            NetworkMode::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub image: String,
    pub stop_timeout: Duration,
    pub memory_bytes: Option<u64>,
    pub pids_limit: Option<u64>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            image: crate::config::DEFAULT_BOT_IMAGE.to_string(),
            stop_timeout: Duration::from_secs(10),
            memory_bytes: Some(1024 * 1024 * 1024),
            pids_limit: Some(512),
        }
    }
}

#[derive(Clone)]
pub struct BotLifecycle {
    store: Arc<dyn BotStore>,
    runtime: Arc<dyn ContainerRuntime>,
    workspaces: Arc<dyn WorkspaceStore>,
    watchdog: StartupWatchdog,
    notifier: Arc<dyn Notifier>,
    proxy: Arc<dyn ProxyRegistrar>,
    config: LaunchConfig,
}

impl BotLifecycle {
    pub fn new(
        store: Arc<dyn BotStore>,
        runtime: Arc<dyn ContainerRuntime>,
        workspaces: Arc<dyn WorkspaceStore>,
        watchdog: StartupWatchdog,
        notifier: Arc<dyn Notifier>,
        proxy: Arc<dyn ProxyRegistrar>,
        config: LaunchConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            workspaces,
            watchdog,
            notifier,
            proxy,
            config,
        }
    }

    async fn load(&self, id: BotId) -> Result<BotRecord, LifecycleError> {
        self.store.get(id).await?.ok_or(LifecycleError::NotFound(id))
    }

    async fn set_status(&self, bot: &BotRecord, next: BotStatus, reason: &str) -> Result<(), LifecycleError> {
        let patch = BotPatch::new().when_status(bot.status).status(next);
        if !self.store.update(bot.id, patch).await? {
            return Err(LifecycleError::Conflict(bot.id));
        }
        tracing::info!(bot_id = %bot.id, from = %bot.status, to = %next, reason, "bot status changed");
        self.notifier.notify(
            &bot.tenant_id.to_string(),
            EVENT_BOT_STATUS,
            status_payload(bot, next, reason),
        );
        Ok(())
    }

    /// Launches the bot's container and hands it to the readiness watchdog.
    /// Already starting or running bots are left alone.
    pub async fn start_bot(&self, id: BotId) -> Result<BotStatus, LifecycleError> {
        let bot = self.load(id).await?;
        let Some(next) = transition(bot.status, Trigger::StartRequested) else {
            if bot.status == BotStatus::Draft {
                return Err(LifecycleError::Draft(id));
            }
            return Ok(bot.status);
        };

        self.set_status(&bot, next, "start").await?;
        let starting = BotRecord {
            status: next,
            ..bot
        };

        match self.launch(&starting).await {
            Ok(container_ref) => {
                self.watchdog.start_monitoring(
                    starting.id,
                    &container_ref,
                    &starting.tenant_id.to_string(),
                );
                Ok(next)
            }
            Err(err) => {
                tracing::warn!(bot_id = %id, error = %format_error_chain(&err), "bot launch failed");
                if let Err(mark) = self.set_status(&starting, BotStatus::Error, "launch_failed").await {
                    tracing::warn!(bot_id = %id, error = %mark, "failed to mark bot as errored");
                }
                Err(LifecycleError::Other(err))
            }
        }
    }

    async fn launch(&self, bot: &BotRecord) -> anyhow::Result<String> {
        use anyhow::Context;

        let key = bot.isolation_key();
        let paths = self
            .workspaces
            .ensure(&key)
            .await
            .context("prepare workspace")?;

        // Leftovers from an earlier launch, by recorded ref and by name.
        if let Some(old) = bot.container_ref.as_deref() {
            self.runtime
                .remove(old)
                .await
                .with_context(|| format!("remove stale container {old}"))?;
        }
        self.runtime
            .remove(&key.container_name())
            .await
            .context("remove stale container by name")?;

        let mut spec = self.container_spec(bot, &key, &paths);
        let mode = self.apply_network_mode(bot, &key, &paths, &mut spec).await;

        let container_ref = self
            .runtime
            .create_container(&spec)
            .await
            .context("create container")?;
        self.store
            .update(bot.id, BotPatch::new().container_ref(Some(container_ref.clone())))
            .await
            .context("record container ref")?;
        self.runtime
            .start(&container_ref)
            .await
            .context("start container")?;

        tracing::info!(
            bot_id = %bot.id,
            container_ref = %container_ref,
            name = %spec.name,
            mode = mode.as_str(),
            "bot container started"
        );
        Ok(container_ref)
    }

    fn container_spec(&self, bot: &BotRecord, key: &IsolationKey, paths: &WorkspacePaths) -> ContainerSpec {
        let labels = BTreeMap::from([
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
            (LABEL_ISOLATION_KEY.to_string(), key.as_str().to_string()),
            (LABEL_BOT_ID.to_string(), bot.id.to_string()),
            (LABEL_TENANT_ID.to_string(), bot.tenant_id.to_string()),
        ]);

        let mut env = BTreeMap::from([
            ("BERTH_BOT_ID".to_string(), bot.id.to_string()),
            ("BERTH_HOSTNAME".to_string(), bot.hostname.clone()),
            ("BERTH_WORKSPACE".to_string(), WORKSPACE_MOUNT.to_string()),
        ]);
        if let Some(port) = bot.gateway_port {
            env.insert("BERTH_GATEWAY_PORT".to_string(), port.to_string());
        }

        ContainerSpec {
            name: key.container_name(),
            image: bot.image.clone().unwrap_or_else(|| self.config.image.clone()),
            labels,
            env,
            mounts: vec![Mount {
                source: paths.workspace.clone(),
                target: WORKSPACE_MOUNT.to_string(),
                read_only: false,
            }],
            gateway_port: bot.gateway_port,
            memory_bytes: self.config.memory_bytes,
            pids_limit: self.config.pids_limit,
        }
    }

    /// Proxy mode when registration succeeds; otherwise direct mode with the
    /// secrets directory mounted.
    async fn apply_network_mode(
        &self,
        bot: &BotRecord,
        key: &IsolationKey,
        paths: &WorkspacePaths,
        spec: &mut ContainerSpec,
    ) -> NetworkMode {
        if self.proxy.is_enabled() {
            match self.proxy.register(bot, key).await {
                Ok(token) => {
                    spec.env.insert("BERTH_NETWORK_MODE".to_string(), "proxy".to_string());
                    spec.env.insert("BERTH_PROXY_TOKEN".to_string(), token.token);
                    spec.env.insert("BERTH_PROXY_URL".to_string(), token.proxy_url);
                    return NetworkMode::Proxy;
                }
                Err(err) => {
                    tracing::warn!(
                        bot_id = %bot.id,
                        error = %format_error_chain(&err),
                        "proxy registration failed; falling back to direct mode"
                    );
                }
            }
        }

        spec.env.insert("BERTH_NETWORK_MODE".to_string(), "direct".to_string());
        spec.env.insert("BERTH_SECRETS_DIR".to_string(), SECRETS_MOUNT.to_string());
        spec.mounts.push(Mount {
            source: paths.secrets.clone(),
            target: SECRETS_MOUNT.to_string(),
            read_only: true,
        });
        NetworkMode::Direct
    }

    pub async fn stop_bot(&self, id: BotId) -> Result<BotStatus, LifecycleError> {
        let bot = self.load(id).await?;
        self.watchdog.stop_monitoring(&id);

        // Status first, so the stop/die events this causes find the bot
        // already stopped.
        let status = match transition(bot.status, Trigger::StopRequested) {
            Some(next) => {
                self.set_status(&bot, next, "stop").await?;
                next
            }
            None => bot.status,
        };

        if let Some(container_ref) = bot.container_ref.as_deref() {
            match self.runtime.stop(container_ref, self.config.stop_timeout).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    tracing::debug!(bot_id = %id, container_ref, "container already gone");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(status)
    }

    /// Tears down the container of a bot that is being deleted. The record's
    /// status is left as is.
    pub async fn release_bot(&self, id: BotId) -> Result<(), LifecycleError> {
        let bot = self.load(id).await?;
        self.watchdog.stop_monitoring(&id);

        if bot.container_ref.is_some() {
            self.store
                .update(id, BotPatch::new().container_ref(None))
                .await?;
        }
        if let Some(container_ref) = bot.container_ref.as_deref() {
            self.runtime.remove(container_ref).await?;
        }
        self.runtime
            .remove(&bot.isolation_key().container_name())
            .await?;

        tracing::info!(bot_id = %id, "bot container released");
        Ok(())
    }
}
