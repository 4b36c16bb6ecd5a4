use anyhow::{Context, Result};
use common::bootstrap::HandlerRegistry;
use common::task::HandlerResponse;
use common::worker::{
    InvocationAssignment, InvocationCompleteRequest, InvocationPollRequest, InvocationPollResponse,
    WorkerHeartbeatRequest, WorkerId, WorkerRegisterRequest, WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::HostConfig;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const IDLE_WAIT: Duration = Duration::from_secs(1);
const BUSY_WAIT: Duration = Duration::from_millis(500);

/// Ejecuta una invocación en un hilo de bloqueo, cortando en su timeout.
/// `Err` si el handler no pudo ni correr.
pub async fn execute(
    registry: Arc<HandlerRegistry>,
    assignment: &InvocationAssignment,
) -> Result<HandlerResponse, String> {
    let handler = assignment.handler.clone();
    let request = assignment.request.clone();
    let limit = Duration::from_secs(assignment.timeout_secs.max(1));

    let job = tokio::task::spawn_blocking(move || registry.dispatch(&handler, &request));
    match timeout(limit, job).await {
        Ok(Ok(Ok(resp))) => Ok(resp),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(e)) => Err(format!("el handler entró en pánico: {e}")),
        // el orquestador ya dio la invocación por vencida
        Err(_) => Err(format!("{} superó {:?}", assignment.handler, limit)),
    }
}

struct Host {
    client: Client,
    base_url: String,
    hostname: String,
    concurrency: u32,
    registry: Arc<HandlerRegistry>,
}

impl Host {
    async fn register(&self) -> Result<WorkerId> {
        let url = format!("{}/api/v1/workers/register", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(&WorkerRegisterRequest {
                hostname: self.hostname.clone(),
                max_concurrency: self.concurrency,
                handlers: self.registry.names(),
            })
            .send()
            .await
            .with_context(|| format!("registrando contra {}", self.base_url))?
            .error_for_status()?;
        let WorkerRegisterResponse { worker_id } = res.json().await?;

        info!(
            "handler host {} registrado con concurrency={} handlers={:?} contra {}",
            worker_id,
            self.concurrency,
            self.registry.names(),
            self.base_url
        );
        Ok(worker_id)
    }

    async fn heartbeat(&self, worker_id: &str, sys: &mut System) {
        sys.refresh_cpu();
        sys.refresh_memory();

        let url = format!("{}/api/v1/workers/heartbeat", self.base_url);
        let sent = self
            .client
            .post(&url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.to_string(),
                cpu_percent: Some(sys.global_cpu_info().cpu_usage()),
                mem_used_mb: Some(sys.used_memory() / 1024 / 1024),
            })
            .send()
            .await;
        if let Err(e) = sent {
            warn!("heartbeat falló: {}", e);
        }
    }

    /// `Ok(None)` si el orquestador ya no conoce este host.
    async fn poll(&self, worker_id: &str) -> Result<Option<Option<InvocationAssignment>>> {
        let url = format!("{}/api/v1/invocations/next", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(&InvocationPollRequest {
                worker_id: worker_id.to_string(),
            })
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let InvocationPollResponse { invocation } = res.error_for_status()?.json().await?;
        Ok(Some(invocation))
    }
}

async fn report(
    client: &Client,
    base_url: &str,
    worker_id: WorkerId,
    invocation_id: String,
    outcome: Result<HandlerResponse, String>,
) {
    let url = format!("{}/api/v1/invocations/complete", base_url);
    let sent = client
        .post(&url)
        .json(&InvocationCompleteRequest {
            worker_id,
            invocation_id: invocation_id.clone(),
            outcome,
        })
        .send()
        .await;
    match sent {
        Ok(r) if r.status() == StatusCode::NOT_FOUND => {
            warn!("el orquestador ya no espera la invocación {}", invocation_id)
        }
        Ok(_) => {}
        Err(e) => warn!("no se pudo reportar la invocación {}: {}", invocation_id, e),
    }
}

/// Loop principal del handler host.
/// - Se registra con los handlers que tiene.
/// - Manda heartbeats con CPU/MEM.
/// - Pide invocaciones mientras tenga slots libres.
/// - Corre cada una en paralelo (hasta HANDLER_CONCURRENCY).
pub async fn run(config: HostConfig, registry: Arc<HandlerRegistry>) -> Result<()> {
    let host = Host {
        client: Client::new(),
        base_url: config.orchestrator_url.trim_end_matches('/').to_string(),
        hostname: hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string(),
        concurrency: config.concurrency,
        registry,
    };

    let mut worker_id = host.register().await?;
    let sem = Arc::new(Semaphore::new(config.concurrency as usize));

    // System para leer CPU y memoria
    let mut sys = System::new_all();
    let mut last_heartbeat: Option<Instant> = None;

    loop {
        if last_heartbeat.map_or(true, |t| t.elapsed() >= HEARTBEAT_INTERVAL) {
            host.heartbeat(&worker_id, &mut sys).await;
            last_heartbeat = Some(Instant::now());
        }

        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                sleep(BUSY_WAIT).await;
                continue;
            }
        };

        let assignment = match host.poll(&worker_id).await {
            Ok(Some(a)) => a,
            Ok(None) => {
                warn!("el orquestador no reconoce a {}, re-registrando", worker_id);
                drop(permit);
                worker_id = host.register().await?;
                last_heartbeat = None;
                continue;
            }
            Err(e) => {
                warn!("error pidiendo invocación: {}", e);
                drop(permit);
                sleep(IDLE_WAIT).await;
                continue;
            }
        };

        let Some(assignment) = assignment else {
            drop(permit);
            sleep(IDLE_WAIT).await;
            continue;
        };

        info!(
            "tengo invocación {} ({} {} para {})",
            assignment.invocation_id,
            assignment.request.request_type,
            assignment.handler,
            assignment.resource_id
        );

        let client = host.client.clone();
        let base_url = host.base_url.clone();
        let registry = host.registry.clone();
        let wid = worker_id.clone();

        tokio::spawn(async move {
            let outcome = execute(registry, &assignment).await;
            match &outcome {
                Ok(resp) if resp.is_success() => {
                    info!("invocación {} terminó bien", assignment.invocation_id)
                }
                Ok(resp) => warn!(
                    "invocación {} FAILED: {}",
                    assignment.invocation_id,
                    resp.reason.as_deref().unwrap_or("sin motivo")
                ),
                Err(e) => warn!("invocación {} no corrió: {}", assignment.invocation_id, e),
            }

            report(&client, &base_url, wid, assignment.invocation_id.clone(), outcome).await;

            // liberar el slot al terminar
            drop(permit);
        });
    }
}
