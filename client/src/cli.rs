use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::bootstrap::{FileFetcher, HandlerRegistry, LocalInvoker};
use common::dag::{self, OrderedPlan};
use common::driver::{ConvergenceDriver, LocalDriver, TeardownReport, DEFAULT_MAX_PARALLEL};
use common::lifecycle::LifecycleState;
use common::lineage_log::extract_run_events;
use common::provision::LocalProvisioner;
use common::results::StackOutputs;
use common::stack::{self, LineageStackConfig};
use common::state_store::{FileStateStore, ResourceRecord};
use common::store::LocalObjectStore;
use common::worker::WorkerMetrics;
use common::{wiring, DeployRequest, DeploymentInfo, DeploymentStatus, PlanView};
use reqwest::Client;
use std::{env, fs, path::PathBuf, sync::Arc, time::Duration};

/// - En Docker: ORCHESTRATOR_URL=http://orchestrator:8080
/// - Local: default http://localhost:8080
fn orchestrator_base_url() -> String {
    env::var("ORCHESTRATOR_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "CLI para desplegar y consultar el stack de lineage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct LocalArgs {
    /// JSON con la config del stack (si falta, la de por defecto)
    #[arg(long, value_name = "ARCHIVO")]
    config: Option<PathBuf>,

    /// Archivo de state con los tokens de identidad
    #[arg(long, default_value = ".lineage/resources.json")]
    state_file: PathBuf,

    /// Raíz del object store local
    #[arg(long, default_value = ".lineage/store")]
    store_root: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MAX_PARALLEL)]
    max_parallel: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dry run local: orden, olas y acción por recurso
    Plan {
        #[command(flatten)]
        local: LocalArgs,
    },
    /// Aplica el stack en este proceso, sin orquestador
    ApplyLocal {
        #[command(flatten)]
        local: LocalArgs,
    },
    /// Borra en orden inverso lo aplicado con apply-local
    TeardownLocal {
        #[command(flatten)]
        local: LocalArgs,
    },
    /// Manda un despliegue al orquestador
    Deploy {
        #[arg(long, value_name = "ARCHIVO")]
        config: Option<PathBuf>,
        /// Espera a que termine
        #[arg(long)]
        wait: bool,
    },
    /// Consulta el estado de un despliegue
    Status {
        #[arg(value_name = "DEPLOYMENT_ID")]
        id: String,
    },
    /// Salidas del stack de un despliegue
    Outputs {
        #[arg(value_name = "DEPLOYMENT_ID")]
        id: String,
    },
    /// Borra los recursos de un despliegue
    Teardown {
        #[arg(value_name = "DEPLOYMENT_ID")]
        id: String,
    },
    /// Recursos con identidad persistida en el orquestador
    Resources,

    Workers,

    /// Extrae los eventos de lineage de un log de job
    Lineage {
        #[arg(value_name = "LOG")]
        log: PathBuf,
        /// Imprime el JSON crudo de cada evento
        #[arg(long)]
        raw: bool,
    },
}

pub fn load_config(path: Option<&PathBuf>) -> Result<LineageStackConfig> {
    let Some(path) = path else {
        return Ok(LineageStackConfig::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("leyendo {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("config inválida en {}", path.display()))
}

fn validated_graph(config: &LineageStackConfig) -> Result<OrderedPlan> {
    let descriptors = stack::build_stack(config)?;
    let graph = dag::build(&descriptors)?;
    wiring::validate_pipeline(&graph)?;
    Ok(graph)
}

type Local = LocalDriver<LocalInvoker, FileStateStore, LocalProvisioner>;

/// Driver en proceso. Los handlers leen orígenes locales o `file://`.
fn local_driver(args: &LocalArgs) -> Result<Local> {
    let state = Arc::new(
        FileStateStore::open(&args.state_file)
            .with_context(|| format!("abriendo state {}", args.state_file.display()))?,
    );
    let objects = Arc::new(LocalObjectStore::new(&args.store_root));
    let registry = HandlerRegistry::with_bootstrap(objects.clone(), Arc::new(FileFetcher));
    let invoker = Arc::new(LocalInvoker::new(Arc::new(registry)));
    let provisioner = Arc::new(LocalProvisioner::new(objects));
    Ok(LocalDriver::new(invoker, state, provisioner).with_max_parallel(args.max_parallel))
}

/* ---------------- impresión ---------------- */

fn print_plan(view: &PlanView) {
    println!("Plan ({} recursos):", view.order.len());
    for (i, wave) in view.waves.iter().enumerate() {
        println!("  ola {}: {}", i, wave.join(", "));
    }
    println!("  acciones:");
    for a in &view.actions {
        println!("    {:<28} {:<22} {:?}", a.resource_id, format!("{:?}", a.kind), a.action);
    }
}

fn print_outputs(outputs: &StackOutputs) {
    println!("Outputs:");
    for (key, value) in outputs.entries() {
        println!("  {key:<16}: {value}");
    }
}

fn print_deployment(d: &DeploymentInfo) {
    println!("Despliegue:");
    println!("  id: {}", d.id);
    println!("  stack: {}", d.stack_name);
    println!("  estado: {:?}", d.status);
    println!(
        "  recursos: total={}, ok={}, fallidos={}, pendientes={}",
        d.resources_total, d.resources_succeeded, d.resources_failed, d.resources_pending
    );
    println!("  submitted_at: {}", d.submitted_at);
    if let Some(ref started) = d.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = d.finished_at {
        println!("  finalizado: {}", done);
    }
    for r in &d.resources {
        if r.state != LifecycleState::Succeeded {
            println!("  - {} {:?}{}", r.resource_id, r.state, r.error.as_deref().map(|e| format!(": {e}")).unwrap_or_default());
        }
    }
    if let Some(ref e) = d.error {
        println!("  error: {}", e);
    }
    if let Some(ref outputs) = d.outputs {
        print_outputs(outputs);
    }
}

fn print_teardown(report: &TeardownReport) {
    println!("Borrados: {}", report.removed.join(", "));
    for (id, e) in &report.failed {
        println!("  no se pudo borrar {id}: {e}");
    }
    for (id, dependent) in &report.blocked {
        println!("  {id} no se tocó: {dependent} sigue vivo");
    }
}

async fn error_body(resp: reqwest::Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    format!("status {status}: {body}")
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = orchestrator_base_url();

    match cli.command {
        Commands::Plan { local } => {
            let config = load_config(local.config.as_ref())?;
            let graph = validated_graph(&config)?;
            let driver = local_driver(&local)?;
            let plan = driver.plan(graph)?;
            print_plan(&plan.view());
        }

        Commands::ApplyLocal { local } => {
            let config = load_config(local.config.as_ref())?;
            let graph = validated_graph(&config)?;
            let driver = local_driver(&local)?;

            let (report, outputs) = tokio::task::spawn_blocking(move || -> Result<_> {
                let (plan, report) = driver.plan_and_apply(graph)?;
                let outputs = stack::outputs(plan.graph(), driver.store())?;
                Ok((report, outputs))
            })
            .await??;

            for r in &report.resources {
                println!(
                    "  {:<28} {:?} -> {:?}{}",
                    r.resource_id,
                    r.action,
                    r.state,
                    r.error.as_deref().map(|e| format!(" ({e})")).unwrap_or_default()
                );
            }
            print_outputs(&outputs);
            if let Some(e) = report.first_error {
                bail!("el despliegue falló: {e}");
            }
        }

        Commands::TeardownLocal { local } => {
            let config = load_config(local.config.as_ref())?;
            let graph = validated_graph(&config)?;
            let driver = local_driver(&local)?;
            let report = tokio::task::spawn_blocking(move || driver.teardown(&graph)).await??;
            print_teardown(&report);
            if !report.is_clean() {
                bail!("teardown incompleto");
            }
        }

        Commands::Deploy { config, wait } => {
            let stack = load_config(config.as_ref())?;
            let url = format!("{}/api/v1/deployments", base_url);
            let resp = client.post(&url).json(&DeployRequest { stack }).send().await?;
            if !resp.status().is_success() {
                bail!("despliegue rechazado ({})", error_body(resp).await);
            }
            let mut info: DeploymentInfo = resp.json().await?;
            println!("Despliegue creado: {}", info.id);

            while wait
                && matches!(info.status, DeploymentStatus::Accepted | DeploymentStatus::Running)
            {
                tokio::time::sleep(Duration::from_secs(2)).await;
                let url = format!("{}/api/v1/deployments/{}", base_url, info.id);
                info = client.get(&url).send().await?.error_for_status()?.json().await?;
            }
            print_deployment(&info);
            if info.status == DeploymentStatus::Failed {
                bail!("el despliegue falló");
            }
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/deployments/{id}", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let info: DeploymentInfo = resp.json().await?;
                print_deployment(&info);
            } else {
                println!("No se encontró el despliegue {id}");
            }
        }

        Commands::Outputs { id } => {
            let url = format!("{}/api/v1/deployments/{id}/outputs", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let outputs: StackOutputs = resp.json().await?;
                print_outputs(&outputs);
            } else {
                println!("Sin outputs para {id} ({})", error_body(resp).await);
            }
        }

        Commands::Teardown { id } => {
            let url = format!("{}/api/v1/deployments/{id}/teardown", base_url);
            let resp = client.post(&url).send().await?;
            if !resp.status().is_success() {
                bail!("teardown rechazado ({})", error_body(resp).await);
            }
            let report: TeardownReport = resp.json().await?;
            print_teardown(&report);
        }

        Commands::Resources => {
            let url = format!("{}/api/v1/resources", base_url);
            let records: Vec<ResourceRecord> =
                client.get(&url).send().await?.error_for_status()?.json().await?;
            if records.is_empty() {
                println!("No hay recursos persistidos.");
            }
            for r in records {
                println!("{:<28} {:<22} {}", r.resource_id, format!("{:?}", r.kind), r.physical_id);
                for (k, v) in &r.attributes {
                    println!("    {k} = {v}");
                }
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay handler hosts registrados.");
                }
                for w in workers {
                    println!("Host {}", w.worker_id);
                    println!("  host           : {}", w.hostname);
                    println!("  dead           : {}", w.dead);
                    println!("  handlers       : {}", w.handlers.join(", "));
                    println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                    println!(
                        "  concurrency    : max={}, activas={}",
                        w.max_concurrency, w.active_invocations
                    );
                    println!(
                        "  invocaciones   : started={}, ok={}, failed={}",
                        w.invocations_started, w.invocations_succeeded, w.invocations_failed
                    );
                    match w.avg_invocation_ms {
                        Some(avg) => println!("  avg_ms         : {:.1}", avg),
                        None => println!("  avg_ms         : (sin datos)"),
                    }
                    match w.cpu_percent {
                        Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
                        None => println!("  cpu_percent    : (sin datos)"),
                    }
                    match w.mem_used_mb {
                        Some(mem) => println!("  mem_used_mb    : {}", mem),
                        None => println!("  mem_used_mb    : (sin datos)"),
                    }
                    println!();
                }
            } else {
                println!("Error consultando /api/v1/workers (status {})", resp.status());
            }
        }

        Commands::Lineage { log, raw } => {
            let text = fs::read_to_string(&log).with_context(|| format!("leyendo {}", log.display()))?;
            let events = extract_run_events(text.lines());
            if events.is_empty() {
                println!("No se encontraron eventos de lineage.");
            }
            for e in events {
                if raw {
                    println!("{}", e.raw);
                } else {
                    println!(
                        "{} {:<8} run={} job={}",
                        e.summary.event_time, e.summary.event_type, e.summary.run_id, e.summary.job_name
                    );
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, body: &str) -> PathBuf {
        let path = env::temp_dir().join(format!("client-{name}-{}.json", std::process::id()));
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn sin_archivo_usa_la_config_por_defecto() {
        let config = load_config(None).unwrap();
        assert_eq!(config, LineageStackConfig::default());
    }

    #[test]
    fn config_parcial_completa_con_defaults() {
        let path = temp_file("parcial", r#"{ "account": "123456789012", "expanded_grants": true }"#);
        let config = load_config(Some(&path)).unwrap();

        assert_eq!(config.bucket(), "dzlineageblog-123456789012");
        assert!(config.expanded_grants);
        assert_eq!(config.crawler_name, "AWSomeRetailCrawler");
    }

    #[test]
    fn config_rota_da_error_con_la_ruta() {
        let path = temp_file("rota", "{ no es json");
        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("config inválida"));
    }

    #[test]
    fn subcomandos_parsean() {
        let cli = Cli::try_parse_from(["client", "apply-local", "--store-root", "/tmp/s", "--max-parallel", "2"]).unwrap();
        match cli.command {
            Commands::ApplyLocal { local } => {
                assert_eq!(local.store_root, PathBuf::from("/tmp/s"));
                assert_eq!(local.max_parallel, 2);
                assert!(local.config.is_none());
            }
            other => panic!("subcomando inesperado: {other:?}"),
        }

        let cli = Cli::try_parse_from(["client", "deploy", "--wait"]).unwrap();
        assert!(matches!(cli.command, Commands::Deploy { wait: true, config: None }));
    }

    #[test]
    fn stack_por_defecto_valida() {
        let graph = validated_graph(&LineageStackConfig::default()).unwrap();
        assert!(graph.position(stack::COPY_FILES) < graph.position(stack::CRAWLER));
    }
}
