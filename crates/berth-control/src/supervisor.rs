use std::sync::Arc;

use anyhow::Context;

/// A long-lived part of the control plane.
#[async_trait::async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> anyhow::Result<()>;
    /// Must cancel every task and timer the component owns.
    async fn stop(&self);
}

/// Starts components in registration order and stops them in reverse.
#[derive(Default)]
pub struct Supervisor {
    components: Vec<Arc<dyn Component>>,
    started: tokio::sync::Mutex<usize>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, component: Arc<dyn Component>) -> Self {
        self.components.push(component);
        self
    }

    /// On failure the components already started are stopped again.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut started = self.started.lock().await;
        for component in self.components.iter().skip(*started) {
            tracing::info!(component = component.name(), "starting");
            if let Err(err) = component
                .start()
                .await
                .with_context(|| format!("start {}", component.name()))
            {
                for prev in self.components[..*started].iter().rev() {
                    prev.stop().await;
                }
                *started = 0;
                return Err(err);
            }
            *started += 1;
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let mut started = self.started.lock().await;
        for component in self.components[..*started].iter().rev() {
            tracing::info!(component = component.name(), "stopping");
            component.stop().await;
        }
        *started = 0;
    }
}
