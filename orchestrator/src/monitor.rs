use crate::state::AppState;
use common::lock;
use common::worker::WorkerId;
use std::time::{Duration, SystemTime};
use tokio::time::sleep;
use tracing::{info, warn};

/// Loop de heartbeats: marca hosts muertos y falla lo que tenían en vuelo.
pub async fn monitor_workers(state: AppState, interval: Duration) {
    loop {
        sleep(interval).await;
        sweep_once(&state, SystemTime::now());
    }
}

/// Una pasada de chequeo:
/// 1. marca hosts sin heartbeat reciente
/// 2. falla sus invocaciones con `HandlerLost`
///
/// No se reencola nada; el driver ve el error y el recurso queda Failed
/// hasta el próximo apply.
pub fn sweep_once(state: &AppState, now: SystemTime) -> Vec<WorkerId> {
    let mut newly_dead: Vec<WorkerId> = Vec::new();
    {
        let mut workers = lock(&state.workers);
        for (id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            // last_heartbeat en el futuro: se ignora
            let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
                continue;
            };
            if elapsed > state.worker_dead_timeout {
                meta.dead = true;
                warn!(
                    "marcando host {} ({}) como DEAD (sin heartbeat hace {:?})",
                    id, meta.hostname, elapsed
                );
                newly_dead.push(id.clone());
            }
        }
    }

    for id in &newly_dead {
        let lost = state.queue.fail_worker(id);
        if lost > 0 {
            info!("{} invocaciones del host {} marcadas como perdidas", lost, id);
        }
    }
    newly_dead
}
