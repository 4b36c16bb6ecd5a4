mod config;
mod handlers;
mod invoker;
mod monitor;
mod state;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::OrchestratorConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("orchestrator=debug,common=info,tower_http=info")),
        )
        .init();

    let config = OrchestratorConfig::from_env();
    let state = AppState::new(&config)
        .with_context(|| format!("abriendo state en {}", config.state_file.display()))?;

    // router HTTP
    let app = handlers::build_router(state.clone());

    // monitor de heartbeats en segundo plano
    let monitor_state = state.clone();
    let interval = config.monitor_interval;
    tokio::spawn(async move {
        monitor::monitor_workers(monitor_state, interval).await;
    });

    let listener = TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", config.addr))?;
    info!(
        "orquestador escuchando en {} (state={}, store={})",
        listener.local_addr()?,
        config.state_file.display(),
        config.store_root.display()
    );

    axum::serve(listener, app).await?;
    Ok(())
}
