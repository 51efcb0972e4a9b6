//! Periodic liveness probing and the stuck-`starting` sweep.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use berth_lifecycle::{BotId, BotStatus, FailureStreaks, HealthStatus, Trigger, transition};
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    config::HealthConfig,
    notify::{EVENT_BOT_HEALTH, EVENT_BOT_STATUS, Notifier, health_payload, status_payload},
    probe::HealthProbe,
    store::{BotPatch, BotRecord, BotStore},
    supervisor::Component,
    support::format_error_chain,
    watchdog::StartupWatchdog,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LivenessReport {
    pub probed: usize,
    pub failed: usize,
    pub flipped: usize,
    pub errors: usize,
}

pub fn is_stuck(updated_at: DateTime<Utc>, now: DateTime<Utc>, deadline: Duration) -> bool {
    let Ok(deadline) = chrono::Duration::from_std(deadline) else {
        return false;
    };
    now.signed_duration_since(updated_at) >= deadline
}

#[derive(Clone)]
pub struct HealthProber {
    store: Arc<dyn BotStore>,
    probe: Arc<dyn HealthProbe>,
    watchdog: StartupWatchdog,
    notifier: Arc<dyn Notifier>,
    config: HealthConfig,
    streaks: Arc<Mutex<FailureStreaks>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl HealthProber {
    pub fn new(
        store: Arc<dyn BotStore>,
        probe: Arc<dyn HealthProbe>,
        watchdog: StartupWatchdog,
        notifier: Arc<dyn Notifier>,
        config: HealthConfig,
    ) -> Self {
        let streaks = FailureStreaks::new(config.failure_threshold);
        Self {
            store,
            probe,
            watchdog,
            notifier,
            config,
            streaks: Arc::new(Mutex::new(streaks)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    fn endpoint(&self, bot: &BotRecord) -> Option<String> {
        let port = bot.gateway_port?;
        Some(format!(
            "http://{}:{}{}",
            self.config.probe_host, port, self.config.probe_path
        ))
    }

    fn streaks(&self) -> std::sync::MutexGuard<'_, FailureStreaks> {
        self.streaks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Probes every running bot once.
    pub async fn liveness_sweep(&self) -> anyhow::Result<LivenessReport> {
        let bots = self.store.list_by_status(BotStatus::Running).await?;
        let mut report = LivenessReport::default();

        for bot in &bots {
            let Some(endpoint) = self.endpoint(bot) else {
                continue;
            };
            report.probed += 1;
            match self.check(bot, &endpoint).await {
                Ok((ok, flipped)) => {
                    if !ok {
                        report.failed += 1;
                    }
                    if flipped {
                        report.flipped += 1;
                    }
                }
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(bot_id = %bot.id, error = %format_error_chain(&err), "health bookkeeping failed");
                }
            }
        }

        let running: HashSet<BotId> = bots.iter().map(|b| b.id).collect();
        self.streaks().retain(|id| running.contains(id));

        Ok(report)
    }

    async fn check(&self, bot: &BotRecord, endpoint: &str) -> anyhow::Result<(bool, bool)> {
        let timeout = self.config.probe_timeout;
        let ok = match tokio::time::timeout(timeout, self.probe.probe(endpoint, timeout)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::debug!(bot_id = %bot.id, endpoint, error = %err, "health probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(bot_id = %bot.id, endpoint, "health probe timed out");
                false
            }
        };

        let change = self.streaks().record(bot.id, ok, bot.health_status);

        let mut patch = BotPatch::new().checked_at(Utc::now());
        if let Some(health) = change {
            patch = patch.health(health);
        }
        self.store.update(bot.id, patch).await?;

        if let Some(health) = change {
            match health {
                HealthStatus::Unhealthy => tracing::warn!(
                    bot_id = %bot.id,
                    failures = self.config.failure_threshold,
                    "bot marked unhealthy"
                ),
                HealthStatus::Healthy => tracing::info!(bot_id = %bot.id, "bot healthy again"),
            }
            self.notifier.notify(
                &bot.tenant_id.to_string(),
                EVENT_BOT_HEALTH,
                health_payload(bot, health),
            );
        }

        Ok((ok, change.is_some()))
    }

    /// Forces every bot that has sat in `starting` past the deadline out of
    /// it. Returns how many were moved.
    pub async fn stuck_sweep(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let policy = self.config.stuck_policy;
        let bots = self.store.list_by_status(BotStatus::Starting).await?;
        let mut moved = 0;

        for bot in bots {
            if !is_stuck(bot.updated_at, now, self.config.stuck_deadline) {
                continue;
            }
            let Some(next) = transition(bot.status, Trigger::StuckDeadline(policy)) else {
                continue;
            };

            let patch = BotPatch::new().when_status(bot.status).status(next);
            match self.store.update(bot.id, patch).await {
                Ok(true) => {
                    moved += 1;
                    self.watchdog.stop_monitoring(&bot.id);
                    tracing::warn!(
                        bot_id = %bot.id,
                        since = %bot.updated_at,
                        to = %next,
                        "bot stuck in starting; forced out"
                    );
                    self.notifier.notify(
                        &bot.tenant_id.to_string(),
                        EVENT_BOT_STATUS,
                        status_payload(&bot, next, "stuck"),
                    );
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(bot_id = %bot.id, error = %format_error_chain(&err), "failed to resolve stuck bot");
                }
            }
        }

        Ok(moved)
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, sweep: F)
    where
        F: Fn(HealthProber) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let this = self.clone();
        let span = tracing::info_span!("health_sweep", sweep = name);
        self.tasks.spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = this.cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Err(err) = sweep(this.clone()).await {
                        tracing::warn!(error = %format_error_chain(&err), "sweep failed; retrying next period");
                    }
                }
            }
            .instrument(span),
        );
    }
}

#[async_trait::async_trait]
impl Component for HealthProber {
    fn name(&self) -> &'static str {
        "health-prober"
    }

    async fn start(&self) -> anyhow::Result<()> {
        tracing::warn!(
            policy = ?self.config.stuck_policy,
            deadline_ms = self.config.stuck_deadline.as_millis() as u64,
            "bots stuck in starting past the deadline will be forced to {}",
            self.config.stuck_policy.target()
        );
        self.spawn_loop("liveness", self.config.interval, |p| async move {
            let report = p.liveness_sweep().await?;
            tracing::debug!(?report, "liveness sweep done");
            Ok(())
        });
        self.spawn_loop("stuck", self.config.stuck_interval, |p| async move {
            p.stuck_sweep(Utc::now()).await.map(|_| ())
        });
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
