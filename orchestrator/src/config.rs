use std::{env, path::PathBuf, str::FromStr, time::Duration};

use common::driver::DEFAULT_MAX_PARALLEL;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub addr: String,
    pub state_file: PathBuf,
    /// Raíz del object store local, compartida con los handler hosts.
    pub store_root: PathBuf,
    pub max_parallel: usize,
    pub worker_dead_timeout: Duration,
    pub monitor_interval: Duration,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            addr: env::var("ORCHESTRATOR_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            state_file: env_or("STATE_FILE", PathBuf::from("/data/state/resources.json")),
            store_root: env_or("STORE_ROOT", PathBuf::from("/data/store")),
            max_parallel: env_or("MAX_PARALLEL", DEFAULT_MAX_PARALLEL),
            worker_dead_timeout: Duration::from_secs(env_or("WORKER_DEAD_TIMEOUT_SECS", 20)),
            monitor_interval: Duration::from_secs(env_or("MONITOR_INTERVAL_SECS", 5)),
        }
    }
}
