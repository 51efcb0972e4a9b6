use std::time::Duration;

use berth_lifecycle::{BotStatus, HealthStatus};
use serde_json::{Value, json};

use crate::store::BotRecord;

pub const EVENT_BOT_STATUS: &str = "bot.status";
pub const EVENT_BOT_HEALTH: &str = "bot.health";

/// Fire-and-forget push of state changes to a tenant. Delivery failures never
/// reach the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, tenant_id: &str, event: &str, payload: Value);
}

pub fn status_payload(bot: &BotRecord, status: BotStatus, reason: &str) -> Value {
    json!({
        "bot_id": bot.id,
        "hostname": bot.hostname,
        "status": status.as_str(),
        "previous": bot.status.as_str(),
        "reason": reason,
    })
}

pub fn health_payload(bot: &BotRecord, health: HealthStatus) -> Value {
    json!({
        "bot_id": bot.id,
        "hostname": bot.hostname,
        "health": health.as_str(),
    })
}

/// Used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, tenant_id: &str, event: &str, payload: Value) {
        tracing::info!(tenant_id, event, %payload, "notification");
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, tenant_id: &str, event: &str, payload: Value) {
        let body = json!({
            "tenant_id": tenant_id,
            "event": event,
            "payload": payload,
        });
        let client = self.client.clone();
        let url = self.url.clone();
        let event = event.to_string();
        tokio::spawn(async move {
            let res = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(err) = res {
                tracing::warn!(%err, event = %event, "notification delivery failed");
            }
        });
    }
}
