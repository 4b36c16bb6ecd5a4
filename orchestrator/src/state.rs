use common::driver::LocalDriver;
use common::provision::LocalProvisioner;
use common::stack::LineageStackConfig;
use common::state_store::FileStateStore;
use common::store::LocalObjectStore;
use common::worker::WorkerId;
use common::{DeploymentId, DeploymentInfo};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use crate::config::OrchestratorConfig;
use crate::invoker::{InvocationQueue, QueueInvoker};

pub type Driver = LocalDriver<QueueInvoker, FileStateStore, LocalProvisioner>;

#[derive(Clone)]
pub struct AppState {
    pub deployments: Arc<Mutex<HashMap<DeploymentId, DeploymentInfo>>>,
    // config con la que se creó cada despliegue, para outputs y teardown
    pub stacks: Arc<Mutex<HashMap<DeploymentId, LineageStackConfig>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    pub queue: Arc<InvocationQueue>,
    pub driver: Arc<Driver>,
    pub worker_dead_timeout: Duration,
}

impl AppState {
    pub fn new(config: &OrchestratorConfig) -> io::Result<Self> {
        let state_store = Arc::new(FileStateStore::open(&config.state_file)?);
        let provisioner = Arc::new(LocalProvisioner::new(Arc::new(LocalObjectStore::new(
            &config.store_root,
        ))));
        Ok(Self::with_stores(
            state_store,
            provisioner,
            config.max_parallel,
            config.worker_dead_timeout,
        ))
    }

    pub fn with_stores(
        state_store: Arc<FileStateStore>,
        provisioner: Arc<LocalProvisioner>,
        max_parallel: usize,
        worker_dead_timeout: Duration,
    ) -> Self {
        let queue = Arc::new(InvocationQueue::new());
        let invoker = Arc::new(QueueInvoker::new(queue.clone()));
        let driver = LocalDriver::new(invoker, state_store, provisioner).with_max_parallel(max_parallel);

        Self {
            deployments: Arc::new(Mutex::new(HashMap::new())),
            stacks: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            queue,
            driver: Arc::new(driver),
            worker_dead_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,
    pub handlers: Vec<String>,

    // Métricas
    pub invocations_started: u64,
    pub invocations_succeeded: u64,
    pub invocations_failed: u64,
    pub total_invocation_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_used_mb: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, max_concurrency: u32, handlers: Vec<String>) -> Self {
        Self {
            hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency,
            handlers,
            invocations_started: 0,
            invocations_succeeded: 0,
            invocations_failed: 0,
            total_invocation_ms: 0,
            last_cpu_percent: None,
            last_mem_used_mb: None,
        }
    }
}
