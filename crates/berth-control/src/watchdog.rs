//! Startup readiness watchdog.
//!
//! Each start of a bot spawns one task that tails the container's logs until
//! a readiness marker shows up or the deadline passes. Both outcomes move the
//! bot from `starting` to `running`; the deadline is optimistic so a quiet
//! bot is never held in `starting` by the watch alone.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use berth_lifecycle::{BotId, Trigger, transition};
use berth_runtime::{ContainerRuntime, LogQuery};
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    config::WatchdogConfig,
    monitor::{MonitorHandle, MonitorRegistry},
    notify::{EVENT_BOT_STATUS, Notifier, status_payload},
    store::{BotPatch, BotStore},
    supervisor::Component,
};

/// Lowercase substrings that mark a bot as ready. Any one is enough.
pub const READINESS_MARKERS: &[&str] = &[
    "[gateway] listening",
    "gateway ready",
    "bot is ready",
    "listening on ws://",
];

pub fn find_readiness_marker(logs: &str) -> Option<&'static str> {
    let lower = logs.to_ascii_lowercase();
    READINESS_MARKERS.iter().copied().find(|m| lower.contains(m))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchOutcome {
    Ready(&'static str),
    TimedOut,
    Cancelled,
}

#[derive(Clone)]
pub struct StartupWatchdog {
    store: Arc<dyn BotStore>,
    runtime: Arc<dyn ContainerRuntime>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<dyn MonitorRegistry>,
    config: WatchdogConfig,
    next_task: Arc<AtomicU64>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl StartupWatchdog {
    pub fn new(
        store: Arc<dyn BotStore>,
        runtime: Arc<dyn ContainerRuntime>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<dyn MonitorRegistry>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            notifier,
            registry,
            config,
            next_task: Arc::new(AtomicU64::new(1)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Starts watching `container_ref`, replacing any watch already running
    /// for the bot.
    pub fn start_monitoring(&self, bot_id: BotId, container_ref: &str, tenant_id: &str) {
        if self.shutdown.is_cancelled() {
            tracing::debug!(bot_id = %bot_id, "watchdog is shut down; not monitoring");
            return;
        }

        let handle = MonitorHandle {
            task_id: self.next_task.fetch_add(1, Ordering::Relaxed),
            bot_id,
            container_ref: container_ref.to_string(),
            tenant_id: tenant_id.to_string(),
            started_at: Utc::now(),
            cancel: self.shutdown.child_token(),
        };

        if let Some(prev) = self.registry.set(handle.clone()) {
            prev.cancel();
            tracing::debug!(bot_id = %bot_id, task_id = prev.task_id, "replaced readiness watch");
        }

        tracing::info!(bot_id = %bot_id, container_ref, task_id = handle.task_id, "watching for readiness");

        let span = tracing::info_span!("startup_watchdog", bot_id = %bot_id, task_id = handle.task_id);
        let this = self.clone();
        self.tasks.spawn(async move { this.run(handle).await }.instrument(span));
    }

    pub fn stop_monitoring(&self, bot_id: &BotId) {
        if let Some(handle) = self.registry.remove(bot_id) {
            handle.cancel();
            tracing::debug!(bot_id = %bot_id, task_id = handle.task_id, "readiness watch cancelled");
        }
    }

    pub fn has_active_monitor(&self, bot_id: &BotId) -> bool {
        self.registry.has(bot_id)
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Cancels every watch and waits for the tasks to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for handle in self.registry.drain() {
            handle.cancel();
        }
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn run(&self, handle: MonitorHandle) {
        match self.watch(&handle).await {
            WatchOutcome::Ready(marker) => {
                tracing::info!(marker, "readiness marker seen");
                self.finish(&handle, Trigger::ReadinessDetected, "ready").await;
            }
            WatchOutcome::TimedOut => {
                tracing::warn!(
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "no readiness marker before deadline; assuming running"
                );
                self.finish(&handle, Trigger::ReadinessTimeout, "timeout").await;
            }
            WatchOutcome::Cancelled => {
                tracing::debug!("readiness watch stopped");
            }
        }
        self.registry.remove_task(&handle.bot_id, handle.task_id);
    }

    async fn watch(&self, handle: &MonitorHandle) -> WatchOutcome {
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let query = LogQuery {
            tail: self.config.log_tail,
            since: Some(handle.started_at),
        };

        loop {
            tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => return WatchOutcome::Cancelled,
                _ = &mut deadline => return WatchOutcome::TimedOut,
                _ = ticker.tick() => {}
            }

            let logs = tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => return WatchOutcome::Cancelled,
                _ = &mut deadline => return WatchOutcome::TimedOut,
                res = self.runtime.get_logs(&handle.container_ref, &query) => res,
            };

            match logs {
                Ok(text) => {
                    if let Some(marker) = find_readiness_marker(&text) {
                        return WatchOutcome::Ready(marker);
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "log fetch failed; still watching");
                }
            }
        }
    }

    async fn finish(&self, handle: &MonitorHandle, trigger: Trigger, reason: &str) {
        if handle.is_cancelled() {
            return;
        }

        let bot = match self.store.get(handle.bot_id).await {
            Ok(Some(bot)) => bot,
            Ok(None) => {
                tracing::debug!("bot disappeared while starting");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %crate::support::format_error_chain(&err), "failed to load bot");
                return;
            }
        };

        let Some(next) = transition(bot.status, trigger) else {
            tracing::debug!(status = %bot.status, "bot already left starting");
            return;
        };

        // Newer watch owns the bot now.
        if self
            .registry
            .get(&handle.bot_id)
            .is_some_and(|current| current.task_id != handle.task_id)
        {
            return;
        }
        // Exits seen after this write belong to a running bot.
        self.registry.remove_task(&handle.bot_id, handle.task_id);

        let patch = BotPatch::new().when_status(bot.status).status(next);
        match self.store.update(bot.id, patch).await {
            Ok(true) => {
                tracing::info!(from = %bot.status, to = %next, reason, "bot status changed");
                self.notifier
                    .notify(&handle.tenant_id, EVENT_BOT_STATUS, status_payload(&bot, next, reason));
            }
            Ok(false) => {
                tracing::debug!("status changed concurrently; leaving it");
            }
            Err(err) => {
                tracing::warn!(error = %crate::support::format_error_chain(&err), "failed to persist readiness");
            }
        }
    }
}

#[async_trait::async_trait]
impl Component for StartupWatchdog {
    fn name(&self) -> &'static str {
        "startup-watchdog"
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use berth_lifecycle::BotStatus;

    use super::*;
    use crate::{monitor::InMemoryMonitorRegistry, testkit::*};

    struct Harness {
        store: Arc<MemoryStore>,
        runtime: Arc<FakeRuntime>,
        notifier: Arc<RecordingNotifier>,
        watchdog: StartupWatchdog,
    }

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
            log_tail: 50,
        }
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::default());
        let runtime = Arc::new(FakeRuntime::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let watchdog = StartupWatchdog::new(
            store.clone(),
            runtime.clone(),
            notifier.clone(),
            Arc::new(InMemoryMonitorRegistry::new()),
            config(),
        );
        Harness {
            store,
            runtime,
            notifier,
            watchdog,
        }
    }

    fn starting_bot(h: &Harness) -> crate::store::BotRecord {
        let mut b = bot("alpha", BotStatus::Starting);
        b.container_ref = Some("c1".to_string());
        h.store.insert(b.clone());
        b
    }

    #[test]
    fn markers_match_case_insensitively() {
        assert_eq!(
            find_readiness_marker("boot\n[Gateway] Listening on 0.0.0.0:18789\n"),
            Some("[gateway] listening")
        );
        assert_eq!(find_readiness_marker("BOT IS READY"), Some("bot is ready"));
        assert_eq!(find_readiness_marker("loading plugins..."), None);
    }

    #[tokio::test(start_paused = true)]
    async fn marker_promotes_to_running_and_ends_watch() {
        let h = harness();
        let b = starting_bot(&h);
        h.runtime.set_logs("c1", "booting\nloading\n");
        h.watchdog.start_monitoring(b.id, "c1", "t1");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.watchdog.has_active_monitor(&b.id));
        assert_eq!(h.store.status(b.id), BotStatus::Starting);

        h.runtime.set_logs("c1", "booting\n[gateway] listening on :18789\n");
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(h.store.status(b.id), BotStatus::Running);
        assert!(!h.watchdog.has_active_monitor(&b.id));
        assert_eq!(h.notifier.count(EVENT_BOT_STATUS), 1);
        assert_eq!(h.notifier.last_payload()["reason"], "ready");
        assert!(h.runtime.log_queries().iter().all(|q| q.since.is_some() && q.tail == 50));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_forces_running() {
        let h = harness();
        let b = starting_bot(&h);
        h.watchdog.start_monitoring(b.id, "c1", "t1");

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(h.store.status(b.id), BotStatus::Starting);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.store.status(b.id), BotStatus::Running);
        assert!(!h.watchdog.has_active_monitor(&b.id));
        assert_eq!(h.notifier.last_payload()["reason"], "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn log_errors_do_not_end_the_watch() {
        let h = harness();
        let b = starting_bot(&h);
        h.runtime.fail_logs(true);
        h.watchdog.start_monitoring(b.id, "c1", "t1");

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(h.runtime.log_calls() >= 3);
        assert!(h.watchdog.has_active_monitor(&b.id));
        assert_eq!(h.store.status(b.id), BotStatus::Starting);

        h.runtime.fail_logs(false);
        h.runtime.set_logs("c1", "gateway ready");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.store.status(b.id), BotStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_watch() {
        let h = harness();
        let b = starting_bot(&h);
        h.watchdog.start_monitoring(b.id, "c1", "t1");
        let first = h.watchdog.registry.get(&b.id).unwrap();
        h.watchdog.start_monitoring(b.id, "c1", "t1");
        let second = h.watchdog.registry.get(&b.id).unwrap();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_ne!(first.task_id, second.task_id);
        assert_eq!(h.watchdog.active_count(), 1);

        // The cancelled task must not evict its replacement on exit.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.watchdog.has_active_monitor(&b.id));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_monitoring_is_idempotent_and_leaves_status() {
        let h = harness();
        let b = starting_bot(&h);
        h.watchdog.start_monitoring(b.id, "c1", "t1");
        h.watchdog.stop_monitoring(&b.id);
        h.watchdog.stop_monitoring(&b.id);
        assert!(!h.watchdog.has_active_monitor(&b.id));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.store.status(b.id), BotStatus::Starting);
        assert_eq!(h.notifier.count(EVENT_BOT_STATUS), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn never_overwrites_a_bot_that_left_starting() {
        let h = harness();
        let b = starting_bot(&h);
        h.watchdog.start_monitoring(b.id, "c1", "t1");
        h.store.set_status(b.id, BotStatus::Stopped);
        h.runtime.set_logs("c1", "bot is ready");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.store.status(b.id), BotStatus::Stopped);
        assert_eq!(h.notifier.count(EVENT_BOT_STATUS), 0);
        assert!(!h.watchdog.has_active_monitor(&b.id));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_every_watch() {
        let h = harness();
        let a = starting_bot(&h);
        let b = starting_bot(&h);
        h.watchdog.start_monitoring(a.id, "c1", "t1");
        h.watchdog.start_monitoring(b.id, "c1", "t1");
        assert_eq!(h.watchdog.active_count(), 2);

        h.watchdog.shutdown().await;
        assert_eq!(h.watchdog.active_count(), 0);

        h.watchdog.start_monitoring(a.id, "c1", "t1");
        assert_eq!(h.watchdog.active_count(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.store.status(a.id), BotStatus::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_log_fetch_does_not_delay_the_deadline() {
        let h = harness();
        let b = starting_bot(&h);
        h.runtime.delay_logs(Duration::from_secs(17));
        h.watchdog.start_monitoring(b.id, "c1", "t1");

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(h.store.status(b.id), BotStatus::Starting);

        // A fetch is still in flight at the deadline.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.store.status(b.id), BotStatus::Running);
        assert_eq!(h.notifier.last_payload()["reason"], "timeout");
        assert!(!h.watchdog.has_active_monitor(&b.id));
    }

    #[tokio::test(start_paused = true)]
    async fn bot_deleted_mid_watch_ends_quietly() {
        let h = harness();
        let b = starting_bot(&h);
        h.watchdog.start_monitoring(b.id, "c1", "t1");

        tokio::time::sleep(Duration::from_secs(5)).await;
        h.store.remove(b.id);
        h.runtime.set_logs("c1", "gateway ready");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!h.watchdog.has_active_monitor(&b.id));
        assert_eq!(h.notifier.count(EVENT_BOT_STATUS), 0);
    }

    /// Records whether a watch was still registered when each write landed.
    struct RegistryAtWrite {
        inner: Arc<MemoryStore>,
        registry: Arc<InMemoryMonitorRegistry>,
        seen: std::sync::Mutex<Vec<bool>>,
    }

    #[async_trait::async_trait]
    impl BotStore for RegistryAtWrite {
        async fn get(&self, id: BotId) -> anyhow::Result<Option<crate::store::BotRecord>> {
            self.inner.get(id).await
        }

        async fn find_by_container_ref(&self, container_ref: &str) -> anyhow::Result<Option<crate::store::BotRecord>> {
            self.inner.find_by_container_ref(container_ref).await
        }

        async fn list_active(&self) -> anyhow::Result<Vec<crate::store::BotRecord>> {
            self.inner.list_active().await
        }

        async fn list_by_status(&self, status: BotStatus) -> anyhow::Result<Vec<crate::store::BotRecord>> {
            self.inner.list_by_status(status).await
        }

        async fn update(&self, id: BotId, patch: BotPatch) -> anyhow::Result<bool> {
            self.seen.lock().unwrap().push(self.registry.has(&id));
            self.inner.update(id, patch).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn watch_is_released_before_running_is_written() {
        let inner = Arc::new(MemoryStore::default());
        let registry = Arc::new(InMemoryMonitorRegistry::new());
        let store = Arc::new(RegistryAtWrite {
            inner: inner.clone(),
            registry: registry.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let runtime = Arc::new(FakeRuntime::default());
        let watchdog = StartupWatchdog::new(
            store.clone(),
            runtime.clone(),
            Arc::new(RecordingNotifier::default()),
            registry,
            config(),
        );

        let mut b = bot("alpha", BotStatus::Starting);
        b.container_ref = Some("c1".to_string());
        inner.insert(b.clone());
        runtime.set_logs("c1", "bot is ready");
        watchdog.start_monitoring(b.id, "c1", "t1");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(inner.status(b.id), BotStatus::Running);
        assert_eq!(*store.seen.lock().unwrap(), vec![false]);
    }
}
