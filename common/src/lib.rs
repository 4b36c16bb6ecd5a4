use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod bootstrap;
pub mod dag;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod lineage_log;
pub mod provision;
pub mod results;
pub mod stack;
pub mod state_store;
pub mod store;
pub mod task;
pub mod wiring;
pub mod worker;

pub type ResourceId = String;
pub type PhysicalId = String;
pub type DeploymentId = String;

/// Toma el lock aunque otro hilo haya entrado en pánico con él tomado.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/* --------- Despliegues --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub stack: stack::LineageStackConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Accepted,
    Running,
    Succeeded,
    Failed,
    TornDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub id: DeploymentId,
    pub stack_name: String,
    pub status: DeploymentStatus,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub resources_total: u32,
    pub resources_succeeded: u32,
    pub resources_failed: u32,
    pub resources_pending: u32,

    #[serde(default)]
    pub resources: Vec<driver::ResourceReport>,
    /// Primer error fatal, en orden de finalización.
    pub error: Option<String>,
    pub outputs: Option<results::StackOutputs>,
}

impl DeploymentInfo {
    pub fn accepted(id: DeploymentId, stack_name: impl Into<String>) -> Self {
        Self {
            id,
            stack_name: stack_name.into(),
            status: DeploymentStatus::Accepted,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            resources_total: 0,
            resources_succeeded: 0,
            resources_failed: 0,
            resources_pending: 0,
            resources: Vec::new(),
            error: None,
            outputs: None,
        }
    }

    /// Vuelca un reporte de apply en los contadores.
    pub fn record_apply(&mut self, report: &driver::ApplyReport) {
        self.resources_total = report.resources.len() as u32;
        self.resources_succeeded = report.count(lifecycle::LifecycleState::Succeeded);
        self.resources_failed = report.count(lifecycle::LifecycleState::Failed);
        self.resources_pending = report.count(lifecycle::LifecycleState::Pending);
        self.resources = report.resources.clone();
        self.error = report.first_error.clone();
        self.status = if report.succeeded() {
            DeploymentStatus::Succeeded
        } else {
            DeploymentStatus::Failed
        };
    }
}

/// Vista de un plan sin aplicar (dry run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanView {
    pub order: Vec<ResourceId>,
    pub waves: Vec<Vec<ResourceId>>,
    pub edges: Vec<dag::Edge>,
    pub actions: Vec<driver::PlannedAction>,
}
