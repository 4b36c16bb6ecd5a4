use std::{env, path::PathBuf};

const DEFAULT_HANDLER_CONCURRENCY: u32 = 2;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub orchestrator_url: String,
    /// Raíz del object store donde escriben los handlers.
    pub store_root: PathBuf,
    pub concurrency: u32,
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self {
            orchestrator_url: env::var("ORCHESTRATOR_URL")
                .unwrap_or_else(|_| "http://orchestrator:8080".to_string()),
            store_root: env::var("STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/data/store")),
            concurrency: env::var("HANDLER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_HANDLER_CONCURRENCY),
        }
    }
}
