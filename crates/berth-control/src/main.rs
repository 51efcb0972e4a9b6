use std::sync::Arc;

use berth_control::{
    config::ControlConfig,
    events::EventConsumer,
    health::HealthProber,
    http::{self, OpsState},
    lifecycle::{BotLifecycle, LaunchConfig},
    monitor::InMemoryMonitorRegistry,
    notify::{LogNotifier, Notifier, WebhookNotifier},
    probe::HttpHealthProbe,
    proxy::{DisabledProxy, HttpProxyRegistrar, ProxyRegistrar},
    reconcile::Reconciler,
    store::{BotStore, SeaOrmBotStore},
    supervisor::Supervisor,
    watchdog::StartupWatchdog,
};
use berth_runtime::{ContainerRuntime, DockerConfig, DockerRuntime, FsWorkspaces, WorkspaceStore};
use sea_orm_migration::MigratorTrait;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ControlConfig::from_env()?;

    let db = berth_db::connect(&config.database_url).await?;
    berth_migration::Migrator::up(&db, None).await?;

    let store: Arc<dyn BotStore> = Arc::new(SeaOrmBotStore::new(db));
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(DockerConfig {
        bin: config.docker_bin.clone(),
        timeout: config.runtime_timeout,
    }));
    let workspaces: Arc<dyn WorkspaceStore> = Arc::new(FsWorkspaces::new(&config.data_root));

    let notifier: Arc<dyn Notifier> = match config.notify_url.as_deref() {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    };
    let proxy: Arc<dyn ProxyRegistrar> = match (config.proxy_enabled, config.proxy_url.as_deref()) {
        (true, Some(url)) => Arc::new(HttpProxyRegistrar::new(url)?),
        (true, None) => {
            tracing::warn!("BERTH_PROXY_ENABLED is set without BERTH_PROXY_URL; bots start in direct mode");
            Arc::new(DisabledProxy)
        }
        (false, _) => Arc::new(DisabledProxy),
    };

    let watchdog = StartupWatchdog::new(
        store.clone(),
        runtime.clone(),
        notifier.clone(),
        Arc::new(InMemoryMonitorRegistry::new()),
        config.watchdog,
    );
    let reconciler = Reconciler::new(
        store.clone(),
        runtime.clone(),
        workspaces.clone(),
        watchdog.clone(),
        notifier.clone(),
        config.reconcile,
    );
    let events = EventConsumer::new(
        runtime.clone(),
        store.clone(),
        watchdog.clone(),
        notifier.clone(),
        config.events,
    );
    let health = HealthProber::new(
        store.clone(),
        Arc::new(HttpHealthProbe::new()),
        watchdog.clone(),
        notifier.clone(),
        config.health.clone(),
    );
    let lifecycle = BotLifecycle::new(
        store,
        runtime.clone(),
        workspaces,
        watchdog.clone(),
        notifier,
        proxy,
        LaunchConfig {
            image: config.bot_image.clone(),
            ..LaunchConfig::default()
        },
    );

    let supervisor = Supervisor::new()
        .with(Arc::new(watchdog.clone()))
        .with(Arc::new(reconciler.clone()))
        .with(Arc::new(events))
        .with(Arc::new(health));
    supervisor.start().await?;

    let app = http::router(OpsState {
        lifecycle,
        reconciler,
        watchdog,
        runtime,
    });

    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(l) => l,
        Err(err) => {
            supervisor.stop().await;
            return Err(err.into());
        }
    };
    tracing::info!(addr = %config.listen_addr, "berth-control HTTP listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    supervisor.stop().await;
    served?;
    Ok(())
}
