use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::dag::{self, OrderedPlan};
use common::driver::{ApplyReport, ConvergenceDriver, TeardownReport};
use common::error::DeployError;
use common::results::StackOutputs;
use common::stack::{self, LineageStackConfig};
use common::state_store::{ResourceRecord, StateStore};
use common::worker::{
    InvocationCompleteRequest, InvocationCompleteResponse, InvocationPollRequest,
    InvocationPollResponse, WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use common::{lock, wiring, DeployRequest, DeploymentInfo, DeploymentStatus, PlanView};
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::{AppState, WorkerMeta};

type ApiError = (StatusCode, String);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/plan", post(plan_stack))
        .route("/api/v1/deployments", post(create_deployment))
        .route("/api/v1/deployments/:id", get(get_deployment))
        .route("/api/v1/deployments/:id/outputs", get(get_outputs))
        .route("/api/v1/deployments/:id/teardown", post(teardown_deployment))
        .route("/api/v1/resources", get(list_resources))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/invocations/next", post(assign_invocation))
        .route("/api/v1/invocations/complete", post(complete_invocation))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

fn api_error(e: DeployError) -> ApiError {
    let status = match e {
        DeployError::Graph(_) | DeployError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn not_found(what: &str, id: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("{what} {id} no existe"))
}

/// Descriptores, grafo y validación de cableado. Nada de esto toca
/// recursos: si falla, el despliegue no arranca.
fn validated_graph(config: &LineageStackConfig) -> Result<OrderedPlan, DeployError> {
    let descriptors = stack::build_stack(config)?;
    let graph = dag::build(&descriptors)?;
    wiring::validate_pipeline(&graph)?;
    Ok(graph)
}

fn stack_of(state: &AppState, id: &str) -> Result<LineageStackConfig, ApiError> {
    lock(&state.stacks)
        .get(id)
        .cloned()
        .ok_or_else(|| not_found("despliegue", id))
}

fn update_deployment(state: &AppState, id: &str, f: impl FnOnce(&mut DeploymentInfo)) {
    if let Some(d) = lock(&state.deployments).get_mut(id) {
        f(d);
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Dry run: orden, aristas y acción decidida por recurso
async fn plan_stack(
    State(state): State<AppState>,
    Json(req): Json<DeployRequest>,
) -> Result<Json<PlanView>, ApiError> {
    let graph = validated_graph(&req.stack).map_err(api_error)?;
    let driver = state.driver.clone();

    let plan = tokio::task::spawn_blocking(move || driver.plan(graph))
        .await
        .map_err(internal)?
        .map_err(api_error)?;

    Ok(Json(plan.view()))
}

// Valida en el momento y aplica en segundo plano
async fn create_deployment(
    State(state): State<AppState>,
    Json(req): Json<DeployRequest>,
) -> Result<(StatusCode, Json<DeploymentInfo>), ApiError> {
    let graph = validated_graph(&req.stack).map_err(api_error)?;

    let id = uuid::Uuid::new_v4().to_string();
    let info = DeploymentInfo::accepted(id.clone(), &req.stack.stack_name);

    lock(&state.deployments).insert(id.clone(), info.clone());
    lock(&state.stacks).insert(id.clone(), req.stack);

    info!(
        "despliegue {} aceptado ({} recursos)",
        id,
        graph.len()
    );

    let bg = state.clone();
    tokio::spawn(async move {
        run_deployment(bg, id, graph).await;
    });

    Ok((StatusCode::ACCEPTED, Json(info)))
}

async fn run_deployment(state: AppState, id: String, graph: OrderedPlan) {
    update_deployment(&state, &id, |d| {
        d.status = DeploymentStatus::Running;
        d.started_at = Some(Utc::now());
    });

    let driver = state.driver.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<(ApplyReport, StackOutputs), DeployError> {
        let (plan, report) = driver.plan_and_apply(graph)?;
        let outputs = stack::outputs(plan.graph(), driver.store())?;
        Ok((report, outputs))
    })
    .await;

    match outcome {
        Ok(Ok((report, outputs))) => {
            if let Some(e) = &report.first_error {
                warn!("despliegue {} falló: {}", id, e);
            } else {
                info!("despliegue {} completo", id);
            }
            update_deployment(&state, &id, |d| {
                d.record_apply(&report);
                d.outputs = Some(outputs);
                d.finished_at = Some(Utc::now());
            });
        }
        Ok(Err(e)) => {
            warn!("despliegue {} no pudo planificarse: {}", id, e);
            update_deployment(&state, &id, |d| {
                d.status = DeploymentStatus::Failed;
                d.error = Some(e.to_string());
                d.finished_at = Some(Utc::now());
            });
        }
        Err(e) => {
            warn!("despliegue {}: el hilo del driver terminó mal: {}", id, e);
            update_deployment(&state, &id, |d| {
                d.status = DeploymentStatus::Failed;
                d.error = Some(e.to_string());
                d.finished_at = Some(Utc::now());
            });
        }
    }
}

async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentInfo>, ApiError> {
    lock(&state.deployments)
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| not_found("despliegue", &id))
}

// Outputs según lo persistido en este momento
async fn get_outputs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StackOutputs>, ApiError> {
    let config = stack_of(&state, &id)?;
    let graph = validated_graph(&config).map_err(api_error)?;
    let outputs = stack::outputs(&graph, state.driver.store()).map_err(internal)?;
    Ok(Json(outputs))
}

async fn teardown_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TeardownReport>, ApiError> {
    let config = stack_of(&state, &id)?;
    let graph = validated_graph(&config).map_err(api_error)?;
    let driver = state.driver.clone();

    let report = tokio::task::spawn_blocking(move || driver.teardown(&graph))
        .await
        .map_err(internal)?
        .map_err(api_error)?;

    if report.is_clean() {
        info!("despliegue {} borrado ({} recursos)", id, report.removed.len());
        update_deployment(&state, &id, |d| {
            d.status = DeploymentStatus::TornDown;
            d.finished_at = Some(Utc::now());
        });
    } else {
        warn!(
            "teardown de {} incompleto: {} con error, {} bloqueados",
            id,
            report.failed.len(),
            report.blocked.len()
        );
    }
    Ok(Json(report))
}

async fn list_resources(State(state): State<AppState>) -> Result<Json<Vec<ResourceRecord>>, ApiError> {
    state.driver.store().list().map(Json).map_err(internal)
}

// Registra un handler host nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    info!(
        "handler host registrado: {} (max_concurrency={}, handlers={:?})",
        worker_id, req.max_concurrency, req.handlers
    );
    lock(&state.workers).insert(
        worker_id.clone(),
        WorkerMeta::new(req.hostname, req.max_concurrency, req.handlers),
    );

    Json(WorkerRegisterResponse { worker_id })
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, ApiError> {
    let mut workers = lock(&state.workers);
    let meta = workers
        .get_mut(&req.worker_id)
        .ok_or_else(|| not_found("host", &req.worker_id))?;

    meta.last_heartbeat = SystemTime::now();
    meta.last_cpu_percent = req.cpu_percent;
    meta.last_mem_used_mb = req.mem_used_mb;
    Ok(Json(WorkerHeartbeatResponse { ok: true }))
}

// Entrega la siguiente invocación que este host sepa ejecutar
async fn assign_invocation(
    State(state): State<AppState>,
    Json(req): Json<InvocationPollRequest>,
) -> Result<Json<InvocationPollResponse>, ApiError> {
    let (max_for_worker, handlers) = {
        let workers = lock(&state.workers);
        match workers.get(&req.worker_id) {
            Some(meta) if !meta.dead => (meta.max_concurrency, meta.handlers.clone()),
            // un host dado por muerto tiene que volver a registrarse
            _ => return Err(not_found("host", &req.worker_id)),
        }
    };

    let active = state.queue.active_for(&req.worker_id);
    if active as u32 >= max_for_worker {
        return Ok(Json(InvocationPollResponse { invocation: None }));
    }

    let invocation = state.queue.next_for(&req.worker_id, &handlers);
    if let Some(a) = &invocation {
        info!(
            "asignando invocación {} ({} -> {}) al host {} ({}/{} en vuelo -> +1)",
            a.invocation_id, a.resource_id, a.handler, req.worker_id, active, max_for_worker
        );
        if let Some(meta) = lock(&state.workers).get_mut(&req.worker_id) {
            meta.invocations_started += 1;
        }
    }

    Ok(Json(InvocationPollResponse { invocation }))
}

async fn complete_invocation(
    State(state): State<AppState>,
    Json(req): Json<InvocationCompleteRequest>,
) -> Result<Json<InvocationCompleteResponse>, ApiError> {
    let done = state
        .queue
        .complete(&req.worker_id, &req.invocation_id, req.outcome)
        .ok_or_else(|| not_found("invocación", &req.invocation_id))?;

    if let Some(meta) = lock(&state.workers).get_mut(&done.worker_id) {
        meta.total_invocation_ms += done.duration_ms;
        if done.success {
            meta.invocations_succeeded += 1;
        } else {
            meta.invocations_failed += 1;
        }
    }

    Ok(Json(InvocationCompleteResponse { ok: true }))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();
    let active_by_worker = state.queue.active_by_worker();

    let workers = lock(&state.workers);
    let mut out: Vec<WorkerMetrics> = workers
        .iter()
        .map(|(wid, meta)| {
            let finished = meta.invocations_succeeded + meta.invocations_failed;
            WorkerMetrics {
                worker_id: wid.clone(),
                hostname: meta.hostname.clone(),
                dead: meta.dead,
                handlers: meta.handlers.clone(),
                max_concurrency: meta.max_concurrency,
                last_heartbeat_secs_ago: now
                    .duration_since(meta.last_heartbeat)
                    .unwrap_or_default()
                    .as_secs(),
                active_invocations: active_by_worker.get(wid).copied().unwrap_or(0),
                invocations_started: meta.invocations_started,
                invocations_succeeded: meta.invocations_succeeded,
                invocations_failed: meta.invocations_failed,
                avg_invocation_ms: (finished > 0)
                    .then(|| meta.total_invocation_ms as f64 / finished as f64),
                cpu_percent: meta.last_cpu_percent,
                mem_used_mb: meta.last_mem_used_mb,
            }
        })
        .collect();
    out.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.worker_id.cmp(&b.worker_id)));

    Json(out)
}
