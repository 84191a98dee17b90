//! Herald API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::{create_pool, run_migrations};
use herald_common::redis_pool::create_redis_pool;
use herald_engine::clock::SystemClock;
use herald_engine::directory::{AddressBook, InMemoryAddressBook};
use herald_engine::fatigue_store::{FatigueStore, MemoryFatigueStore, RedisFatigueStore};
use herald_engine::preferences::{InMemoryPreferences, PreferenceStore};
use herald_engine::store::{MemoryStore, PgStore, Store};
use herald_engine::templates::InMemoryTemplates;
use herald_engine::{Engine, EngineDeps};
use herald_notifier::AdapterRegistry;

use herald_api::routes::create_router;
use herald_api::state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("herald_api=debug,herald_engine=debug,tower_http=debug")
    });
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = AppConfig::from_env()?;
    init_tracing(config.log_json);

    tracing::info!("Starting Herald API server...");

    // History, addresses and preferences live in Postgres when it is configured
    let (store, addresses, preferences): (
        Arc<dyn Store>,
        Arc<dyn AddressBook>,
        Arc<dyn PreferenceStore>,
    ) = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url, config.db_max_connections).await?;
            run_migrations(&pool).await?;
            let pg = Arc::new(PgStore::new(pool));
            (pg.clone(), pg.clone(), pg)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, keeping history in memory");
            (
                Arc::new(MemoryStore::new()),
                Arc::new(InMemoryAddressBook::new()),
                Arc::new(InMemoryPreferences::new()),
            )
        }
    };

    let fatigue_store: Arc<dyn FatigueStore> = match &config.redis_url {
        Some(url) => {
            let redis = create_redis_pool(url).await?;
            tracing::info!("Redis connection established");
            Arc::new(RedisFatigueStore::new(redis))
        }
        None => {
            tracing::warn!("REDIS_URL not set, fatigue counters reset on restart");
            Arc::new(MemoryFatigueStore::new())
        }
    };

    let templates = match &config.templates_path {
        Some(path) => InMemoryTemplates::from_json_file(path)?,
        None => {
            tracing::warn!("TEMPLATES_PATH not set, no templates loaded");
            InMemoryTemplates::new()
        }
    };

    let adapters = AdapterRegistry::from_config(&config);
    if adapters.channels().is_empty() {
        tracing::warn!("No channel adapters configured, every dispatch will be undeliverable");
    } else {
        tracing::info!(channels = ?adapters.channels(), "Channel adapters ready");
    }

    let engine = Arc::new(Engine::new(
        config.clone(),
        EngineDeps {
            store,
            fatigue_store,
            templates: Arc::new(templates),
            addresses,
            preferences,
            adapters,
            clock: Arc::new(SystemClock),
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = engine.start(shutdown_rx).await;

    // Build router
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let app = create_router(AppState::new(engine, config))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    tracing::info!("API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the background loops and wait for in-flight work
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task ended abnormally");
        }
    }
    tracing::info!("Herald stopped");
    Ok(())
}
