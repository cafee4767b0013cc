//! Read-only API server over the catalog mirror.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use bookwatch::api::{auth::ApiKeyService, router, ApiState};
use bookwatch::config::Config;
use bookwatch::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;
    bookwatch::logging::init(&config)?;

    let store = Store::open(&config.database_path).context("failed to open store")?;

    let keys = Arc::new(ApiKeyService::new());
    keys.seed_default(config.api_key.as_deref());

    let state = ApiState { store, keys };
    let app = router(state);

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "read API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down API server");
        })
        .await?;
    Ok(())
}
