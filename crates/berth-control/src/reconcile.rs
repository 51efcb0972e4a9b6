//! Boot-time and periodic reconciliation of bot records against the
//! container runtime and the workspace/secret filesystem.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Context;
use berth_lifecycle::{IsolationKey, LiveContainer, SyncOutcome, sync_bot_status};
use berth_runtime::{ContainerRuntime, ManagedContainer, WorkspaceStore};
use serde::Serialize;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    config::ReconcileConfig,
    notify::{EVENT_BOT_STATUS, Notifier, status_payload},
    store::{BotPatch, BotRecord, BotStore},
    supervisor::Component,
    support::format_error_chain,
    watchdog::StartupWatchdog,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanContainer {
    pub container_ref: String,
    pub name: String,
    pub isolation_key: Option<IsolationKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub bots_checked: usize,
    pub statuses_corrected: usize,
    pub refs_corrected: usize,
    /// Bots skipped because a readiness watch owns them.
    pub bots_monitored: usize,
    pub failures: usize,
    /// `false` when container work was skipped.
    pub runtime_reachable: bool,
    pub workspaces_scanned: bool,
    pub secrets_scanned: bool,
    pub orphan_containers: Vec<OrphanContainer>,
    pub orphan_workspaces: Vec<IsolationKey>,
    pub orphan_secrets: Vec<IsolationKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub reconciliation: ReconciliationReport,
    pub containers_removed: usize,
    pub workspaces_removed: usize,
    pub secrets_removed: usize,
    pub failures: usize,
}

/// Keys present on disk that no bot owns.
fn orphan_keys(found: Vec<IsolationKey>, owned: &HashSet<IsolationKey>) -> Vec<IsolationKey> {
    found.into_iter().filter(|k| !owned.contains(k)).collect()
}

/// The container a bot should be judged by: its recorded one if still
/// present, else a running one, else any.
fn pick_container<'a>(bot: &BotRecord, candidates: &[&'a ManagedContainer]) -> Option<&'a ManagedContainer> {
    if let Some(stored) = bot.container_ref.as_deref() {
        if let Some(c) = candidates.iter().find(|c| c.container_ref == stored) {
            return Some(*c);
        }
    }
    candidates
        .iter()
        .find(|c| c.running)
        .or_else(|| candidates.first())
        .copied()
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn BotStore>,
    runtime: Arc<dyn ContainerRuntime>,
    workspaces: Arc<dyn WorkspaceStore>,
    watchdog: StartupWatchdog,
    notifier: Arc<dyn Notifier>,
    config: ReconcileConfig,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn BotStore>,
        runtime: Arc<dyn ContainerRuntime>,
        workspaces: Arc<dyn WorkspaceStore>,
        watchdog: StartupWatchdog,
        notifier: Arc<dyn Notifier>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            workspaces,
            watchdog,
            notifier,
            config,
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Corrects bot statuses from the live runtime and reports orphans. Runs
    /// never overlap; a second caller waits for the first to finish.
    pub async fn reconcile(&self) -> anyhow::Result<ReconciliationReport> {
        let _guard = self.run_lock.lock().await;
        self.reconcile_locked().await
    }

    /// Reconciles, then deletes every orphan found. Per-item failures are
    /// counted and logged.
    pub async fn cleanup_orphans(&self) -> anyhow::Result<CleanupReport> {
        let _guard = self.run_lock.lock().await;
        let reconciliation = self.reconcile_locked().await?;
        let mut out = CleanupReport::default();

        for orphan in &reconciliation.orphan_containers {
            match self.runtime.remove(&orphan.container_ref).await {
                Ok(()) => {
                    out.containers_removed += 1;
                    tracing::info!(container_ref = %orphan.container_ref, name = %orphan.name, "removed orphan container");
                }
                Err(err) => {
                    out.failures += 1;
                    tracing::warn!(container_ref = %orphan.container_ref, %err, "failed to remove orphan container");
                }
            }
        }

        for key in &reconciliation.orphan_workspaces {
            match self.workspaces.delete_workspace(key).await {
                Ok(()) => {
                    out.workspaces_removed += 1;
                    tracing::info!(isolation_key = %key, "removed orphan workspace");
                }
                Err(err) => {
                    out.failures += 1;
                    tracing::warn!(isolation_key = %key, %err, "failed to remove orphan workspace");
                }
            }
        }

        for key in &reconciliation.orphan_secrets {
            match self.workspaces.delete_secrets(key).await {
                Ok(()) => {
                    out.secrets_removed += 1;
                    tracing::info!(isolation_key = %key, "removed orphan secrets");
                }
                Err(err) => {
                    out.failures += 1;
                    tracing::warn!(isolation_key = %key, %err, "failed to remove orphan secrets");
                }
            }
        }

        out.reconciliation = reconciliation;
        Ok(out)
    }

    async fn reconcile_locked(&self) -> anyhow::Result<ReconciliationReport> {
        let bots = self.store.list_active().await.context("list bots")?;
        let owned: HashSet<IsolationKey> = bots.iter().map(BotRecord::isolation_key).collect();
        let mut report = ReconciliationReport {
            bots_checked: bots.len(),
            ..ReconciliationReport::default()
        };

        match self.inventory().await {
            Ok(inventory) => {
                report.runtime_reachable = true;
                self.sync_bots(&bots, &inventory, &mut report).await;
                report.orphan_containers = orphan_containers(&inventory, &owned);
            }
            Err(err) => {
                tracing::warn!(
                    error = %format_error_chain(&err),
                    "container runtime unreachable; skipping container reconciliation"
                );
            }
        }

        match self.workspaces.list_workspace_keys().await {
            Ok(found) => {
                report.workspaces_scanned = true;
                report.orphan_workspaces = orphan_keys(found, &owned);
            }
            Err(err) => tracing::warn!(%err, "workspace directory unavailable; skipping"),
        }
        match self.workspaces.list_secret_keys().await {
            Ok(found) => {
                report.secrets_scanned = true;
                report.orphan_secrets = orphan_keys(found, &owned);
            }
            Err(err) => tracing::warn!(%err, "secret store unavailable; skipping"),
        }

        for c in &report.orphan_containers {
            tracing::warn!(container_ref = %c.container_ref, name = %c.name, "orphan container");
        }
        for key in &report.orphan_workspaces {
            tracing::warn!(isolation_key = %key, "orphan workspace");
        }
        for key in &report.orphan_secrets {
            tracing::warn!(isolation_key = %key, "orphan secrets");
        }

        tracing::info!(
            bots = report.bots_checked,
            corrected = report.statuses_corrected,
            failures = report.failures,
            runtime_reachable = report.runtime_reachable,
            orphan_containers = report.orphan_containers.len(),
            orphan_workspaces = report.orphan_workspaces.len(),
            orphan_secrets = report.orphan_secrets.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn inventory(&self) -> anyhow::Result<Vec<ManagedContainer>> {
        self.runtime.ping().await.context("ping container runtime")?;
        let inventory = self
            .runtime
            .list_managed()
            .await
            .context("list managed containers")?;
        Ok(inventory)
    }

    async fn sync_bots(
        &self,
        bots: &[BotRecord],
        inventory: &[ManagedContainer],
        report: &mut ReconciliationReport,
    ) {
        let mut by_key: HashMap<&IsolationKey, Vec<&ManagedContainer>> = HashMap::new();
        for c in inventory {
            if let Some(key) = &c.isolation_key {
                by_key.entry(key).or_default().push(c);
            }
        }

        for bot in bots {
            if self.watchdog.has_active_monitor(&bot.id) {
                report.bots_monitored += 1;
                continue;
            }
            let key = bot.isolation_key();
            let candidates = by_key.get(&key).map(Vec::as_slice).unwrap_or_default();
            match self.sync_bot(bot, pick_container(bot, candidates)).await {
                Ok(outcome) => {
                    if outcome.status.is_some() {
                        report.statuses_corrected += 1;
                    }
                    if outcome.container_ref.is_some() {
                        report.refs_corrected += 1;
                    }
                }
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(bot_id = %bot.id, error = %format_error_chain(&err), "failed to reconcile bot");
                }
            }
        }
    }

    async fn sync_bot(&self, bot: &BotRecord, container: Option<&ManagedContainer>) -> anyhow::Result<SyncOutcome> {
        let live = match container {
            Some(c) if c.running => Some(LiveContainer {
                container_ref: c.container_ref.clone(),
                running: true,
                exit_code: None,
            }),
            Some(c) => self
                .runtime
                .get_status(&c.container_ref)
                .await
                .with_context(|| format!("inspect {}", c.container_ref))?
                .map(|state| LiveContainer {
                    container_ref: c.container_ref.clone(),
                    running: state.running,
                    exit_code: state.exit_code,
                }),
            None => None,
        };

        let outcome = sync_bot_status(bot.status, bot.container_ref.as_deref(), live.as_ref());
        if outcome.is_noop() {
            return Ok(outcome);
        }

        let mut patch = BotPatch::new().when_status(bot.status);
        if let Some(status) = outcome.status {
            patch = patch.status(status);
        }
        if let Some(container_ref) = outcome.container_ref.clone() {
            patch = patch.container_ref(container_ref);
        }
        if !self.store.update(bot.id, patch).await? {
            tracing::debug!(bot_id = %bot.id, "bot changed during reconciliation; skipped");
            return Ok(SyncOutcome::default());
        }

        if let Some(status) = outcome.status {
            tracing::info!(bot_id = %bot.id, from = %bot.status, to = %status, "reconciled bot status");
            self.notifier.notify(
                &bot.tenant_id.to_string(),
                EVENT_BOT_STATUS,
                status_payload(bot, status, "reconcile"),
            );
        }
        Ok(outcome)
    }

    async fn boot(&self) {
        let res = if self.config.cleanup_orphans_on_boot {
            self.cleanup_orphans().await.map(|r| {
                tracing::info!(
                    containers = r.containers_removed,
                    workspaces = r.workspaces_removed,
                    secrets = r.secrets_removed,
                    failures = r.failures,
                    "boot orphan cleanup finished"
                );
            })
        } else {
            self.reconcile().await.map(|_| ())
        };
        if let Err(err) = res {
            tracing::error!(error = %format_error_chain(&err), "boot reconciliation failed");
        }
    }
}

fn orphan_containers(inventory: &[ManagedContainer], owned: &HashSet<IsolationKey>) -> Vec<OrphanContainer> {
    inventory
        .iter()
        .filter(|c| !c.isolation_key.as_ref().is_some_and(|k| owned.contains(k)))
        .map(|c| OrphanContainer {
            container_ref: c.container_ref.clone(),
            name: c.name.clone(),
            isolation_key: c.isolation_key.clone(),
        })
        .collect()
}

#[async_trait::async_trait]
impl Component for Reconciler {
    fn name(&self) -> &'static str {
        "reconciler"
    }

    /// Runs the boot pass before returning so later components start from
    /// corrected state.
    async fn start(&self) -> anyhow::Result<()> {
        self.boot().await;

        if let Some(period) = self.config.interval {
            let this = self.clone();
            let span = tracing::info_span!("reconcile_loop", period_ms = period.as_millis() as u64);
            self.tasks.spawn(
                async move {
                    loop {
                        tokio::select! {
                            _ = this.cancel.cancelled() => break,
                            _ = tokio::time::sleep(period) => {}
                        }
                        if let Err(err) = this.reconcile().await {
                            tracing::warn!(error = %format_error_chain(&err), "periodic reconciliation failed");
                        }
                    }
                }
                .instrument(span),
            );
        }
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
