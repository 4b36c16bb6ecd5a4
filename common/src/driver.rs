//! Convergence driver: lleva el grafo al estado declarado, ejecutando en
//! paralelo lo que ya tiene sus dependencias listas.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    io,
    panic::{self, AssertUnwindSafe},
    sync::{mpsc, Arc, Mutex},
    thread,
};
use tracing::{debug, info, warn};

use crate::dag::{self, OrderedPlan};
use crate::descriptor::{ResourceDescriptor, ResourceKind};
use crate::error::DeployError;
use crate::lifecycle::{
    CustomResourceInstance, Decision, Invoker, LifecycleManager, LifecycleState,
};
use crate::provision::{physical_name, Provisioner};
use crate::state_store::{ResourceRecord, StateStore};
use crate::task::RequestType;
use crate::{lock, wiring, PhysicalId, PlanView, ResourceId};

pub const DEFAULT_MAX_PARALLEL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Replace,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
    pub action: Action,
}

#[derive(Debug, Clone)]
enum Step {
    Native {
        action: Action,
        previous: Option<ResourceRecord>,
    },
    Custom {
        instance: CustomResourceInstance,
        decision: Decision,
    },
}

impl Step {
    fn action(&self) -> Action {
        match self {
            Step::Native { action, .. } => *action,
            Step::Custom { decision, .. } => match decision {
                Decision::Create { .. } => Action::Create,
                Decision::Update { .. } => Action::Update,
                Decision::Replace { .. } => Action::Replace,
                Decision::Unchanged => Action::Unchanged,
            },
        }
    }
}

/// Acciones decididas contra el estado persistido, en orden del plan.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    graph: OrderedPlan,
    steps: Vec<Step>,
}

impl ExecutionPlan {
    pub fn graph(&self) -> &OrderedPlan {
        &self.graph
    }

    pub fn actions(&self) -> Vec<PlannedAction> {
        self.graph
            .descriptors()
            .iter()
            .zip(&self.steps)
            .map(|(d, step)| PlannedAction {
                resource_id: d.id().to_string(),
                kind: d.kind(),
                action: step.action(),
            })
            .collect()
    }

    pub fn view(&self) -> PlanView {
        PlanView {
            order: self.graph.ids().map(String::from).collect(),
            waves: self
                .graph
                .waves()
                .into_iter()
                .map(|w| w.into_iter().map(String::from).collect())
                .collect(),
            edges: self.graph.edges().to_vec(),
            actions: self.actions(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
    pub action: Action,
    pub state: LifecycleState,
    pub physical_id: Option<PhysicalId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    /// En orden del plan.
    pub resources: Vec<ResourceReport>,
    pub first_error: Option<String>,
}

impl ApplyReport {
    pub fn succeeded(&self) -> bool {
        self.resources
            .iter()
            .all(|r| r.state == LifecycleState::Succeeded)
    }

    pub fn count(&self, state: LifecycleState) -> u32 {
        self.resources.iter().filter(|r| r.state == state).count() as u32
    }

    pub fn state_of(&self, id: &str) -> Option<LifecycleState> {
        self.resources
            .iter()
            .find(|r| r.resource_id == id)
            .map(|r| r.state)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub removed: Vec<ResourceId>,
    /// `(id, error)`; su registro queda para reintentar.
    pub failed: Vec<(ResourceId, String)>,
    /// `(id, dependiente)`: no se tocó porque `dependiente` sigue vivo.
    #[serde(default)]
    pub blocked: Vec<(ResourceId, ResourceId)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

pub trait ConvergenceDriver: Send + Sync {
    /// Decide la acción de cada recurso contra el estado persistido.
    fn plan(&self, graph: OrderedPlan) -> Result<ExecutionPlan, DeployError>;

    /// Aplica el plan. No hace rollback: lo que terminó bien queda.
    ///
    /// El plan se decidió contra el estado de ese momento; si otro apply
    /// corrió en el medio queda viejo. Para desplegar usar `plan_and_apply`.
    fn apply(&self, plan: &ExecutionPlan) -> ApplyReport;

    /// Plan y apply sin que otro apply o teardown se meta entre los dos.
    fn plan_and_apply(&self, graph: OrderedPlan) -> Result<(ExecutionPlan, ApplyReport), DeployError>;

    /// Borra en orden inverso todo lo que tenga registro.
    fn teardown(&self, graph: &OrderedPlan) -> Result<TeardownReport, DeployError>;

    fn persisted_identity(&self, id: &str) -> Result<Option<PhysicalId>, DeployError>;
}

/// Grafo, validación, plan y apply. Los errores de grafo y de validación
/// cortan antes de tocar cualquier recurso.
pub fn deploy<D: ConvergenceDriver + ?Sized>(
    driver: &D,
    descriptors: &[ResourceDescriptor],
) -> Result<ApplyReport, DeployError> {
    let graph = dag::build(descriptors)?;
    wiring::validate_pipeline(&graph)?;
    let (_, report) = driver.plan_and_apply(graph)?;
    Ok(report)
}

/* =========================
   Driver local
   ========================= */

pub struct LocalDriver<I, S, P> {
    invoker: Arc<I>,
    store: Arc<S>,
    provisioner: Arc<P>,
    max_parallel: usize,
    // un apply/teardown a la vez
    apply_lock: Mutex<()>,
}

impl<I, S, P> LocalDriver<I, S, P>
where
    I: Invoker + 'static,
    S: StateStore + 'static,
    P: Provisioner + 'static,
{
    pub fn new(invoker: Arc<I>, store: Arc<S>, provisioner: Arc<P>) -> Self {
        Self {
            invoker,
            store,
            provisioner,
            max_parallel: DEFAULT_MAX_PARALLEL,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn lifecycle(&self) -> LifecycleManager<'_> {
        LifecycleManager::new(self.invoker.as_ref(), self.store.as_ref())
    }

    fn plan_native(&self, descriptor: &ResourceDescriptor) -> Result<Step, DeployError> {
        let previous = self.store.get(descriptor.id())?;
        let config = serde_json::to_value(descriptor.config()).map_err(io::Error::from)?;
        let action = match &previous {
            None => Action::Create,
            Some(r) if r.physical_id != physical_name(descriptor) => Action::Replace,
            Some(r) if r.config.as_ref() != Some(&config) => Action::Update,
            Some(_) => Action::Unchanged,
        };
        Ok(Step::Native { action, previous })
    }

    fn run_step(&self, descriptor: &ResourceDescriptor, step: &Step) -> ResourceReport {
        let mut report = ResourceReport {
            resource_id: descriptor.id().to_string(),
            kind: descriptor.kind(),
            action: step.action(),
            state: LifecycleState::Invoking,
            physical_id: None,
            error: None,
        };

        match step {
            Step::Custom { instance, decision } => {
                let result = self.lifecycle().execute(instance, decision);
                report.state = result.state;
                report.physical_id = Some(result.physical_id);
                report.error = result.error.map(|source| {
                    DeployError::Invocation {
                        resource: descriptor.id().to_string(),
                        source,
                    }
                    .to_string()
                });
            }
            Step::Native { action, previous } => match self.converge_native(descriptor, *action, previous.as_ref()) {
                Ok(physical_id) => {
                    report.state = LifecycleState::Succeeded;
                    report.physical_id = Some(physical_id);
                }
                Err(e) => {
                    report.state = LifecycleState::Failed;
                    report.error = Some(
                        DeployError::Provision {
                            resource: descriptor.id().to_string(),
                            message: e.to_string(),
                        }
                        .to_string(),
                    );
                }
            },
        }
        report
    }

    fn converge_native(
        &self,
        descriptor: &ResourceDescriptor,
        action: Action,
        previous: Option<&ResourceRecord>,
    ) -> io::Result<PhysicalId> {
        if action == Action::Unchanged {
            if let Some(prev) = previous {
                debug!("{}: sin cambios", descriptor.id());
                return Ok(prev.physical_id.clone());
            }
        }

        let provisioned = self.provisioner.provision(descriptor)?;
        self.store.put(ResourceRecord {
            resource_id: descriptor.id().to_string(),
            kind: descriptor.kind(),
            physical_id: provisioned.physical_id.clone(),
            properties: None,
            config: Some(serde_json::to_value(descriptor.config())?),
            attributes: provisioned.attributes,
            updated_at: Utc::now(),
        })?;

        if let (Action::Replace, Some(prev)) = (action, previous) {
            info!(
                "{}: reemplazado {} -> {}",
                descriptor.id(),
                prev.physical_id,
                provisioned.physical_id
            );
            if let Err(e) = self.provisioner.teardown(prev) {
                warn!("{}: no se pudo borrar {}: {}", descriptor.id(), prev.physical_id, e);
            }
        }
        Ok(provisioned.physical_id)
    }

    fn decide_all(&self, graph: OrderedPlan) -> Result<ExecutionPlan, DeployError> {
        let now = Utc::now();
        let mut steps = Vec::with_capacity(graph.len());
        for descriptor in graph.descriptors() {
            let step = if descriptor.kind() == ResourceKind::CustomResourceInstance {
                let instance = CustomResourceInstance::resolve(&graph, descriptor.id())?;
                let decision = self.lifecycle().decide(&instance, now)?;
                Step::Custom { instance, decision }
            } else {
                self.plan_native(descriptor)?
            };
            debug!("plan {}: {:?}", descriptor.id(), step.action());
            steps.push(step);
        }
        Ok(ExecutionPlan { graph, steps })
    }

    /// Ejecuta el plan por olas. Quien llama ya tiene `apply_lock`.
    fn run_plan(&self, plan: &ExecutionPlan) -> ApplyReport {
        let graph = &plan.graph;
        let n = graph.len();

        let mut reports: Vec<ResourceReport> = graph
            .descriptors()
            .iter()
            .zip(&plan.steps)
            .map(|(d, step)| ResourceReport {
                resource_id: d.id().to_string(),
                kind: d.kind(),
                action: step.action(),
                state: LifecycleState::Pending,
                physical_id: None,
                error: None,
            })
            .collect();
        let mut first_error: Option<String> = None;

        let mut waiting: Vec<usize> = (0..n).map(|i| graph.dependency_indices(i).len()).collect();
        // BTreeSet: se despacha en orden del plan
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| waiting[i] == 0).collect();
        let mut running = 0usize;

        info!("apply de {} recursos (max_parallel={})", n, self.max_parallel);

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, ResourceReport)>();

            loop {
                while running < self.max_parallel {
                    let Some(pos) = ready.pop_first() else { break };
                    reports[pos].state = LifecycleState::Invoking;
                    running += 1;

                    let tx = tx.clone();
                    let descriptor = &graph.descriptors()[pos];
                    let step = &plan.steps[pos];
                    scope.spawn(move || {
                        let report = panic::catch_unwind(AssertUnwindSafe(|| self.run_step(descriptor, step)))
                            .unwrap_or_else(|_| ResourceReport {
                                resource_id: descriptor.id().to_string(),
                                kind: descriptor.kind(),
                                action: step.action(),
                                state: LifecycleState::Failed,
                                physical_id: None,
                                error: Some(format!("{}: pánico durante la ejecución", descriptor.id())),
                            });
                        let _ = tx.send((pos, report));
                    });
                }

                if running == 0 {
                    break;
                }
                let Ok((pos, report)) = rx.recv() else { break };
                running -= 1;

                if report.state == LifecycleState::Succeeded {
                    info!("{} -> {:?}", report.resource_id, report.state);
                    for &dependent in graph.dependent_indices(pos) {
                        waiting[dependent] -= 1;
                        if waiting[dependent] == 0 {
                            ready.insert(dependent);
                        }
                    }
                } else {
                    warn!(
                        "{} falló; su subárbol queda pendiente: {:?}",
                        report.resource_id,
                        graph.descendants(&report.resource_id)
                    );
                    if first_error.is_none() {
                        first_error = report.error.clone();
                    }
                }
                reports[pos] = report;
            }
        });

        ApplyReport {
            resources: reports,
            first_error,
        }
    }
}

impl<I, S, P> ConvergenceDriver for LocalDriver<I, S, P>
where
    I: Invoker + 'static,
    S: StateStore + 'static,
    P: Provisioner + 'static,
{
    fn plan(&self, graph: OrderedPlan) -> Result<ExecutionPlan, DeployError> {
        self.decide_all(graph)
    }

    fn apply(&self, plan: &ExecutionPlan) -> ApplyReport {
        let _guard = lock(&self.apply_lock);
        self.run_plan(plan)
    }

    fn plan_and_apply(&self, graph: OrderedPlan) -> Result<(ExecutionPlan, ApplyReport), DeployError> {
        let _guard = lock(&self.apply_lock);
        let plan = self.decide_all(graph)?;
        let report = self.run_plan(&plan);
        Ok((plan, report))
    }

    fn teardown(&self, graph: &OrderedPlan) -> Result<TeardownReport, DeployError> {
        let _guard = lock(&self.apply_lock);
        let mut report = TeardownReport::default();
        // ancestro -> dependiente que sigue vivo
        let mut held: HashMap<&str, &str> = HashMap::new();

        for id in graph.teardown_order() {
            let Some(record) = self.store.get(id)? else {
                continue;
            };
            let Some(descriptor) = graph.get(id) else {
                continue;
            };

            if let Some(&dependent) = held.get(id) {
                warn!("teardown de {} se saltea: {} sigue vivo", id, dependent);
                report.blocked.push((id.to_string(), dependent.to_string()));
                for ancestor in graph.ancestors(id) {
                    held.entry(ancestor).or_insert(dependent);
                }
                continue;
            }

            let outcome: Result<(), String> = if descriptor.kind() == ResourceKind::CustomResourceInstance {
                let instance = CustomResourceInstance::resolve(graph, id)?;
                let result = self.lifecycle().invoke(&instance, RequestType::Delete);
                match result.error {
                    None => Ok(()),
                    Some(e) => Err(e.to_string()),
                }
            } else {
                self.provisioner
                    .teardown(&record)
                    .and_then(|_| self.store.remove(id))
                    .map_err(|e| e.to_string())
            };

            match outcome {
                Ok(()) => {
                    info!("teardown {} ({})", id, record.physical_id);
                    report.removed.push(id.to_string());
                }
                Err(e) => {
                    warn!("teardown de {} falló, se conserva su registro: {}", id, e);
                    report.failed.push((id.to_string(), e));
                    for ancestor in graph.ancestors(id) {
                        held.entry(ancestor).or_insert(id);
                    }
                }
            }
        }
        Ok(report)
    }

    fn persisted_identity(&self, id: &str) -> Result<Option<PhysicalId>, DeployError> {
        Ok(self.store.get(id)?.map(|r| r.physical_id))
    }
}
