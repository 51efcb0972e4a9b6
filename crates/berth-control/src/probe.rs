use std::time::Duration;

/// Liveness check against a bot's gateway endpoint.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> anyhow::Result<()> {
        let res = self.client.get(endpoint).timeout(timeout).send().await?;
        let status = res.status();
        if !status.is_success() {
            anyhow::bail!("health endpoint returned {status}");
        }
        Ok(())
    }
}
