use std::time::Duration;

use anyhow::Context;
use berth_lifecycle::IsolationKey;
use serde::{Deserialize, Serialize};

use crate::store::BotRecord;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyToken {
    pub token: String,
    pub proxy_url: String,
}

/// Registers a bot with the egress proxy that holds its credentials.
#[async_trait::async_trait]
pub trait ProxyRegistrar: Send + Sync {
    fn is_enabled(&self) -> bool;
    async fn register(&self, bot: &BotRecord, key: &IsolationKey) -> anyhow::Result<ProxyToken>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledProxy;

#[async_trait::async_trait]
impl ProxyRegistrar for DisabledProxy {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn register(&self, _bot: &BotRecord, _key: &IsolationKey) -> anyhow::Result<ProxyToken> {
        anyhow::bail!("proxy is disabled")
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    tenant_id: String,
    bot_id: String,
    isolation_key: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpProxyRegistrar {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProxyRegistrar {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ProxyRegistrar for HttpProxyRegistrar {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn register(&self, bot: &BotRecord, key: &IsolationKey) -> anyhow::Result<ProxyToken> {
        let req = RegisterRequest {
            tenant_id: bot.tenant_id.to_string(),
            bot_id: bot.id.to_string(),
            isolation_key: key.as_str(),
        };
        let token = self
            .client
            .post(format!("{}/v1/bots/register", self.base_url))
            .json(&req)
            .send()
            .await
            .context("proxy register request")?
            .error_for_status()
            .context("proxy rejected registration")?
            .json::<ProxyToken>()
            .await
            .context("decode proxy token")?;
        Ok(token)
    }
}
