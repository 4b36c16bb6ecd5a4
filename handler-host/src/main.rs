mod config;
mod fetch;
mod host;

use anyhow::Result;
use common::bootstrap::HandlerRegistry;
use common::store::LocalObjectStore;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::HostConfig;
use crate::fetch::HttpFetcher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("handler_host=debug,common=info,reqwest=info")),
        )
        .init();

    let config = HostConfig::from_env();
    info!(
        "handler host contra {} (store={}, concurrency={})",
        config.orchestrator_url,
        config.store_root.display(),
        config.concurrency
    );

    let store = Arc::new(LocalObjectStore::new(&config.store_root));
    let fetcher = Arc::new(HttpFetcher::new(reqwest::Client::new(), Handle::current()));
    let registry = Arc::new(HandlerRegistry::with_bootstrap(store, fetcher));

    host::run(config, registry).await
}
