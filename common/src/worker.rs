use serde::{Deserialize, Serialize};

use crate::task::{HandlerResponse, InvocationRequest};
use crate::ResourceId;

pub type WorkerId = String;
pub type InvocationId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    pub max_concurrency: u32,
    /// Handlers que este host sabe ejecutar.
    pub handlers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    #[serde(default)]
    pub mem_used_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
}

/// Una invocación lista para ejecutar en un handler host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationAssignment {
    pub invocation_id: InvocationId,
    pub resource_id: ResourceId,
    pub handler: String,
    pub timeout_secs: u64,
    pub request: InvocationRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationPollRequest {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationPollResponse {
    pub invocation: Option<InvocationAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationCompleteRequest {
    pub worker_id: WorkerId,
    pub invocation_id: InvocationId,
    /// `Err` si el host no pudo ni correr el handler.
    pub outcome: Result<HandlerResponse, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationCompleteResponse {
    pub ok: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub dead: bool,
    pub handlers: Vec<String>,
    pub max_concurrency: u32,
    pub last_heartbeat_secs_ago: u64,
    pub active_invocations: u32,
    pub invocations_started: u64,
    pub invocations_succeeded: u64,
    pub invocations_failed: u64,
    pub avg_invocation_ms: Option<f64>,
    pub cpu_percent: Option<f32>,
    pub mem_used_mb: Option<u64>,
}
