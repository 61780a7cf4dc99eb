use std::sync::Arc;

use mailsync::api::{self, AppState};
use mailsync::config::AppConfig;
use mailsync::crypto::CredentialVault;
use mailsync::db;
use mailsync::sync::store::SeaOrmStore;
use mailsync::sync::{DefaultProviderFactory, SyncEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = AppConfig::from_env()?;
    tracing::info!("Mailsync starting...");
    tracing::info!("Server: {}:{}", config.server.host, config.server.port);
    tracing::info!(
        "Sync: concurrency {}, fetch limit {}",
        config.sync.max_concurrency,
        config.sync.fetch_limit
    );

    // Connect to database
    let db = db::connect(&config.database.url).await?;

    // Assemble the sync engine
    let vault = Arc::new(CredentialVault::new(&config.crypto.master_key));
    let store = Arc::new(SeaOrmStore::new(db));
    let factory = Arc::new(DefaultProviderFactory::new(vault, config.oauth.clone()));
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        factory.clone(),
        config.sync.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        engine,
        store,
        factory,
    };

    // Build router
    let app = api::build_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Mailsync API listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
