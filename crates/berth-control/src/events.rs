//! Container event stream consumer.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context;
use berth_lifecycle::{BotStatus, ContainerAction, RuntimeEvent, map_event_to_status};
use berth_runtime::{ContainerRuntime, EventFilter, EventStream};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::EventsConfig,
    notify::{EVENT_BOT_STATUS, Notifier, status_payload},
    store::{BotPatch, BotStore},
    supervisor::Component,
    support::{format_error_chain, truncate_utf8},
    watchdog::StartupWatchdog,
};

/// A single line longer than this is dropped instead of buffered forever.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Reassembles newline-delimited records from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r').trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }

        if self.pending.len() > MAX_LINE_BYTES {
            tracing::warn!(bytes = self.pending.len(), "discarding oversized event line");
            self.pending.clear();
        }
        lines
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "Type", default)]
    kind: Option<String>,
    #[serde(rename = "Action", default)]
    action: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: Option<RawActor>,
    #[serde(default)]
    time: Option<i64>,
    #[serde(rename = "timeNano", default)]
    time_nano: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: Option<String>,
    #[serde(rename = "Attributes", default)]
    attributes: BTreeMap<String, String>,
}

/// Parses one Docker event record. `Ok(None)` for records that are not about
/// a container.
pub fn parse_event_line(line: &str) -> Result<Option<RuntimeEvent>, serde_json::Error> {
    let raw: RawEvent = serde_json::from_str(line)?;

    if raw.kind.as_deref().is_some_and(|k| k != "container") {
        return Ok(None);
    }
    let Some(action) = raw.action.or(raw.status).filter(|a| !a.is_empty()) else {
        return Ok(None);
    };

    let (actor_id, attributes) = match raw.actor {
        Some(actor) => (actor.id, actor.attributes),
        None => (None, BTreeMap::new()),
    };
    let Some(container_ref) = actor_id.or(raw.id).filter(|id| !id.is_empty()) else {
        return Ok(None);
    };

    let timestamp = match (raw.time_nano, raw.time) {
        (Some(nanos), _) => Some(DateTime::<Utc>::from_timestamp_nanos(nanos)),
        (None, Some(secs)) => DateTime::<Utc>::from_timestamp(secs, 0),
        (None, None) => None,
    };

    Ok(Some(RuntimeEvent {
        action: ContainerAction::parse(&action),
        container_ref,
        attributes,
        timestamp,
    }))
}

enum StreamEnd {
    Cancelled,
    Closed,
}

#[derive(Clone)]
pub struct EventConsumer {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn BotStore>,
    watchdog: StartupWatchdog,
    notifier: Arc<dyn Notifier>,
    config: EventsConfig,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventConsumer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn BotStore>,
        watchdog: StartupWatchdog,
        notifier: Arc<dyn Notifier>,
        config: EventsConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            watchdog,
            notifier,
            config,
            cancel: CancellationToken::new(),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribes, consumes until the stream ends, then waits the reconnect
    /// delay and subscribes again. Only one reconnect sleep is ever pending.
    async fn run(self) {
        let filter = EventFilter::managed_lifecycle();
        let mut first = true;

        loop {
            if !first {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                }
            }
            first = false;

            match self.run_once(&filter).await {
                Ok(StreamEnd::Cancelled) => break,
                Ok(StreamEnd::Closed) => {
                    tracing::warn!(
                        retry_ms = self.config.reconnect_delay.as_millis() as u64,
                        "event stream closed; reconnecting"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        error = %format_error_chain(&err),
                        retry_ms = self.config.reconnect_delay.as_millis() as u64,
                        "event stream unavailable; reconnecting"
                    );
                }
            }
        }

        tracing::info!("event consumer stopped");
    }

    async fn run_once(&self, filter: &EventFilter) -> anyhow::Result<StreamEnd> {
        if self.cancel.is_cancelled() {
            return Ok(StreamEnd::Cancelled);
        }
        self.runtime.ping().await.context("ping container runtime")?;
        let stream = self
            .runtime
            .subscribe_events(filter)
            .await
            .context("subscribe to container events")?;
        tracing::info!("subscribed to container events");
        self.consume(stream).await
    }

    async fn consume(&self, mut stream: EventStream) -> anyhow::Result<StreamEnd> {
        let mut lines = LineBuffer::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                next = stream.next() => next,
            };

            let chunk = match next {
                None => return Ok(StreamEnd::Closed),
                Some(res) => res.context("read container events")?,
            };

            for line in lines.push(&chunk) {
                let event = match parse_event_line(&line) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(%err, line = %truncate_utf8(&line, 256), "skipping malformed event");
                        continue;
                    }
                };
                if let Err(err) = self.handle_event(&event).await {
                    tracing::warn!(
                        error = %format_error_chain(&err),
                        action = event.action.as_str(),
                        container_ref = %event.container_ref,
                        "failed to apply container event"
                    );
                }
            }
        }
    }

    /// Applies one event to the bot owning the container. Returns the status
    /// written, if any.
    pub async fn handle_event(&self, event: &RuntimeEvent) -> anyhow::Result<Option<BotStatus>> {
        let Some(bot) = self.store.find_by_container_ref(&event.container_ref).await? else {
            tracing::debug!(container_ref = %event.container_ref, "event for unknown container");
            return Ok(None);
        };

        let monitored = self.watchdog.has_active_monitor(&bot.id);
        let Some(next) = map_event_to_status(&event.action, bot.status, monitored) else {
            tracing::debug!(
                bot_id = %bot.id,
                action = event.action.as_str(),
                status = %bot.status,
                monitored,
                "event ignored"
            );
            return Ok(None);
        };

        let patch = BotPatch::new().when_status(bot.status).status(next);
        if !self.store.update(bot.id, patch).await? {
            tracing::debug!(bot_id = %bot.id, "status moved underneath event; dropped");
            return Ok(None);
        }

        tracing::info!(
            bot_id = %bot.id,
            action = event.action.as_str(),
            from = %bot.status,
            to = %next,
            "bot status changed by container event"
        );

        let tenant_id = bot.tenant_id.to_string();
        if next == BotStatus::Starting {
            if !self.watchdog.has_active_monitor(&bot.id) {
                self.watchdog
                    .start_monitoring(bot.id, &event.container_ref, &tenant_id);
            }
        } else if monitored {
            self.watchdog.stop_monitoring(&bot.id);
        }

        self.notifier.notify(
            &tenant_id,
            EVENT_BOT_STATUS,
            status_payload(&bot, next, event.action.as_str()),
        );
        Ok(Some(next))
    }
}

#[async_trait::async_trait]
impl Component for EventConsumer {
    fn name(&self) -> &'static str {
        "event-consumer"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let span = tracing::info_span!("event_consumer");
        *task = Some(tokio::spawn(self.clone().run().instrument(span)));
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(%err, "event consumer task ended abnormally");
            }
        }
    }
}
