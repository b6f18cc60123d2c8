mod api;
mod config;
mod metrics;

use api::{router, AppState};
use config::ServerConfig;
use medquery_core::SchemaRegistry;
use medquery_storage::{DocumentStore, InMemoryStore, MongoStore, QueryEngine, QueryService};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = ServerConfig::from_env()?;
    let store = open_store(&cfg).await?;
    let engine = QueryEngine::new(store, SchemaRegistry::builtin()?);
    tracing::info!(store = engine.store_kind(), "query engine ready");
    let state = AppState {
        service: QueryService::new(engine),
    };

    let listener = tokio::net::TcpListener::bind(cfg.http_addr).await?;
    tracing::info!("HTTP listening on {}", cfg.http_addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn open_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    if let Some(mongo) = cfg.mongo() {
        match MongoStore::connect(&mongo).await {
            Ok(s) => {
                tracing::info!(database = %mongo.database, "using mongodb store");
                return Ok(Arc::new(s));
            }
            Err(e) => tracing::warn!("mongodb store unavailable: {}; falling back to memory", e),
        }
    }
    let mem = match &cfg.seed_file {
        Some(path) => InMemoryStore::from_seed_file(path)?,
        None => InMemoryStore::new(),
    };
    Ok(Arc::new(mem))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutting down");
    }
}
