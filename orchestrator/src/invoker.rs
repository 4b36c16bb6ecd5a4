//! Cola de invocaciones: el driver encola y espera, los handler hosts
//! piden trabajo por HTTP y devuelven la respuesta.

use std::{
    collections::{HashMap, VecDeque},
    sync::{mpsc, Arc, Mutex},
    time::SystemTime,
};

use common::error::InvocationError;
use common::lifecycle::{FunctionTarget, Invoker};
use common::lock;
use common::task::{HandlerResponse, InvocationRequest};
use common::worker::{InvocationAssignment, InvocationId, WorkerId};
use tracing::{info, warn};

type Reply = mpsc::Sender<Result<HandlerResponse, InvocationError>>;

struct Pending {
    assignment: InvocationAssignment,
    reply: Reply,
}

struct InFlight {
    assignment: InvocationAssignment,
    worker_id: WorkerId,
    started_at: SystemTime,
    reply: Reply,
}

/// Resultado de cerrar una invocación, para las métricas del host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub worker_id: WorkerId,
    pub duration_ms: u64,
    pub success: bool,
}

#[derive(Default)]
pub struct InvocationQueue {
    // invocaciones pendientes de asignar
    pending: Mutex<VecDeque<Pending>>,
    // ya asignadas pero sin respuesta
    in_flight: Mutex<HashMap<InvocationId, InFlight>>,
}

impl InvocationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, assignment: InvocationAssignment, reply: Reply) {
        lock(&self.pending).push_back(Pending { assignment, reply });
    }

    /// Saca la invocación de donde esté; el que la esperaba ya no escucha.
    fn forget(&self, id: &str) {
        lock(&self.pending).retain(|p| p.assignment.invocation_id != id);
        lock(&self.in_flight).remove(id);
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn active_for(&self, worker_id: &str) -> usize {
        lock(&self.in_flight)
            .values()
            .filter(|f| f.worker_id == worker_id)
            .count()
    }

    pub fn active_by_worker(&self) -> HashMap<WorkerId, u32> {
        let mut out = HashMap::new();
        for f in lock(&self.in_flight).values() {
            *out.entry(f.worker_id.clone()).or_insert(0) += 1;
        }
        out
    }

    /// Primera invocación en cola para alguno de los handlers del host.
    pub fn next_for(&self, worker_id: &str, handlers: &[String]) -> Option<InvocationAssignment> {
        let pending = {
            let mut queue = lock(&self.pending);
            let pos = queue
                .iter()
                .position(|p| handlers.contains(&p.assignment.handler))?;
            queue.remove(pos)?
        };

        let assignment = pending.assignment.clone();
        lock(&self.in_flight).insert(
            assignment.invocation_id.clone(),
            InFlight {
                assignment: pending.assignment,
                worker_id: worker_id.to_string(),
                started_at: SystemTime::now(),
                reply: pending.reply,
            },
        );
        Some(assignment)
    }

    /// Entrega la respuesta de un host. `None` si la invocación ya no
    /// existe (timeout o host dado por muerto).
    pub fn complete(
        &self,
        worker_id: &str,
        invocation_id: &str,
        outcome: Result<HandlerResponse, String>,
    ) -> Option<Completed> {
        let in_flight = {
            let mut map = lock(&self.in_flight);
            match map.get(invocation_id) {
                Some(f) if f.worker_id == worker_id => map.remove(invocation_id),
                _ => None,
            }
        }?;

        let handler = in_flight.assignment.handler.clone();
        let result = outcome.map_err(|message| InvocationError::dispatch(handler, message));
        let success = matches!(&result, Ok(r) if r.is_success());
        let _ = in_flight.reply.send(result);

        Some(Completed {
            worker_id: in_flight.worker_id,
            duration_ms: in_flight
                .started_at
                .elapsed()
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            success,
        })
    }

    /// Falla todo lo que tenía un host muerto. No se reencola: el
    /// reintento es otra pasada de convergencia.
    pub fn fail_worker(&self, worker_id: &str) -> usize {
        let lost: Vec<InFlight> = {
            let mut map = lock(&self.in_flight);
            let ids: Vec<InvocationId> = map
                .iter()
                .filter(|(_, f)| f.worker_id == worker_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| map.remove(&id)).collect()
        };

        for f in &lost {
            warn!(
                "invocación {} ({}) perdida con el host {}",
                f.assignment.invocation_id, f.assignment.resource_id, worker_id
            );
            let _ = f.reply.send(Err(InvocationError::HandlerLost {
                handler: f.assignment.handler.clone(),
                worker_id: worker_id.to_string(),
            }));
        }
        lost.len()
    }
}

/// `Invoker` del orquestador: encola y bloquea el hilo del driver hasta
/// la respuesta o el timeout de la función.
#[derive(Clone)]
pub struct QueueInvoker {
    queue: Arc<InvocationQueue>,
}

impl QueueInvoker {
    pub fn new(queue: Arc<InvocationQueue>) -> Self {
        Self { queue }
    }
}

impl Invoker for QueueInvoker {
    fn invoke(
        &self,
        target: &FunctionTarget,
        request: &InvocationRequest,
    ) -> Result<HandlerResponse, InvocationError> {
        let invocation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel();

        self.queue.enqueue(
            InvocationAssignment {
                invocation_id: invocation_id.clone(),
                resource_id: target.resource_id.clone(),
                handler: target.handler.clone(),
                timeout_secs: target.timeout.as_secs(),
                request: request.clone(),
            },
            tx,
        );
        info!(
            "invocación {} encolada para {} ({})",
            invocation_id, target.handler, request.request_type
        );

        match rx.recv_timeout(target.timeout) {
            Ok(result) => result,
            Err(_) => {
                self.queue.forget(&invocation_id);
                Err(InvocationError::Timeout {
                    handler: target.handler.clone(),
                    after: target.timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::task::{PropertyMap, RequestType};
    use std::{thread, time::Duration};

    fn target(timeout: Duration) -> FunctionTarget {
        FunctionTarget {
            resource_id: "create-directories-function".into(),
            function_name: "DataZoneLineageStack-us-east-1-lambda".into(),
            handler: "create_directories".into(),
            timeout,
        }
    }

    fn request() -> InvocationRequest {
        InvocationRequest::new(RequestType::Create, PropertyMap::new())
    }

    fn handlers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Espera a que aparezca algo asignable para `names`.
    fn poll(queue: &InvocationQueue, worker: &str, names: &[&str]) -> InvocationAssignment {
        for _ in 0..200 {
            if let Some(a) = queue.next_for(worker, &handlers(names)) {
                return a;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("nunca llegó la invocación");
    }

    #[test]
    fn sin_hosts_la_invocacion_vence_y_sale_de_la_cola() {
        let queue = Arc::new(InvocationQueue::new());
        let invoker = QueueInvoker::new(queue.clone());

        let err = invoker
            .invoke(&target(Duration::from_millis(30)), &request())
            .unwrap_err();

        assert!(matches!(err, InvocationError::Timeout { .. }));
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn la_respuesta_del_host_vuelve_al_driver() {
        let queue = Arc::new(InvocationQueue::new());
        let invoker = QueueInvoker::new(queue.clone());

        let caller = thread::spawn(move || invoker.invoke(&target(Duration::from_secs(5)), &request()));

        // un host que no tiene el handler no recibe nada
        thread::sleep(Duration::from_millis(20));
        assert!(queue.next_for("w-copy", &handlers(&["copy_files"])).is_none());

        let assignment = poll(&queue, "w-dirs", &["create_directories"]);
        assert_eq!(queue.active_for("w-dirs"), 1);

        let done = queue
            .complete(
                "w-dirs",
                &assignment.invocation_id,
                Ok(HandlerResponse::success().with_data("Response", "Success")),
            )
            .unwrap();
        assert!(done.success);

        let resp = caller.join().unwrap().unwrap();
        assert!(resp.is_success());
        assert_eq!(queue.active_for("w-dirs"), 0);
    }

    #[test]
    fn host_muerto_falla_sus_invocaciones_sin_reencolar() {
        let queue = Arc::new(InvocationQueue::new());
        let invoker = QueueInvoker::new(queue.clone());

        let caller = thread::spawn(move || invoker.invoke(&target(Duration::from_secs(5)), &request()));
        let assignment = poll(&queue, "w-1", &["create_directories"]);

        assert_eq!(queue.fail_worker("w-1"), 1);

        let err = caller.join().unwrap().unwrap_err();
        assert_eq!(
            err,
            InvocationError::HandlerLost {
                handler: "create_directories".into(),
                worker_id: "w-1".into(),
            }
        );
        assert_eq!(queue.pending_len(), 0);
        // la respuesta tardía se ignora
        assert!(queue
            .complete("w-1", &assignment.invocation_id, Ok(HandlerResponse::success()))
            .is_none());
    }
}
