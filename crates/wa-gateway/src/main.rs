use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use wa_agent::factory::ProviderFactory;
use wa_agent::runtime::AgentRuntime;
use wa_agent::sender::SenderFactory;
use wa_core::config::WaConfig;
use wa_core::kv::DashMapStore;
use wa_scheduler::{SchedulerEngine, SchedulerStore};
use wa_store::Store;
use wa_users::ConversationResolver;

mod app;
mod http;
mod media;
mod vision;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "wa_gateway=info,tower_http=debug".into()),
        )
        .init();

    let config_path = std::env::var("WA_CONFIG").ok();
    let config = WaConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({}), using defaults", e);
        WaConfig::default()
    });

    let store = Arc::new(Store::open(&config.database.path)?);
    let scheduler_store = Arc::new(SchedulerStore::open(&config.database.path)?);
    let shared: Arc<dyn wa_core::kv::SharedStore> = Arc::new(DashMapStore::new());

    let client = reqwest::Client::new();
    let factory = Arc::new(ProviderFactory::new(&config.llm));
    let runtime = Arc::new(AgentRuntime::new(Arc::clone(&factory)));
    let senders = Arc::new(SenderFactory::new(client));
    let resolver = Arc::new(ConversationResolver::new(Arc::clone(&store)));

    let state = Arc::new(app::AppState::new(
        Arc::clone(&store),
        Arc::clone(&scheduler_store),
        Arc::clone(&shared),
        runtime,
        senders,
        resolver,
        factory,
        config.webhooks.enabled,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = SchedulerEngine::new(
        Arc::clone(&scheduler_store),
        Arc::clone(&store),
        Arc::clone(&shared),
        Arc::clone(&state) as Arc<dyn wa_scheduler::SchedulerSink>,
        config.scheduler.clone(),
    );
    tokio::spawn(scheduler.run(shutdown_rx));

    let router = app::build_router(Arc::clone(&state));
    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    info!("wa-gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    let _ = shutdown_tx.send(true);
    Ok(())
}
