use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use tokio::time::sleep;
use tracing::{info, warn};

use common::{RunState, SampleTask};

use crate::state::AppState;
use crate::{FAILOVER_SWEEP_INTERVAL_SECS, MAX_TASK_ATTEMPTS, WORKER_HEARTBEAT_TIMEOUT_SECS};

/// Loop principal de tolerancia a fallos:
/// - detecta workers muertos (sin heartbeat)
/// - reencola sus tareas con la misma clave de salida
pub async fn run_failover_loop(state: AppState) {
    loop {
        sleep(Duration::from_secs(FAILOVER_SWEEP_INTERVAL_SECS)).await;

        if let Err(e) = sweep_once(&state, SystemTime::now()) {
            warn!("error en failover sweep: {:?}", e);
        }
    }
}

/// Una pasada de chequeo:
/// 1. marca workers muertos
/// 2. saca de in_flight las tareas de esos workers
/// 3. las reencola (si no superan MAX_TASK_ATTEMPTS) o marca la corrida como FAILED
pub(crate) fn sweep_once(state: &AppState, now: SystemTime) -> Result<(), String> {
    let timeout = Duration::from_secs(WORKER_HEARTBEAT_TIMEOUT_SECS);

    // 1) Detectar qué workers están muertos
    let mut dead_set: HashSet<String> = HashSet::new();
    {
        let mut workers = state.workers.lock().map_err(|_| "lock workers")?;

        for (worker_id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            // last_heartbeat en el futuro: se ignora
            let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
                continue;
            };
            if elapsed > timeout {
                meta.dead = true;
                dead_set.insert(worker_id.clone());
                warn!(
                    "marcando worker {} como DEAD (sin heartbeat hace {:?})",
                    worker_id, elapsed
                );
            }
        }
    }

    if dead_set.is_empty() {
        return Ok(());
    }

    // 2) Sacar tareas de in_flight que pertenecían a esos workers
    let mut orphaned: Vec<(SampleTask, String)> = Vec::new();
    {
        let mut in_flight = state.in_flight.lock().map_err(|_| "lock in_flight")?;
        let mut healthy = HashMap::with_capacity(in_flight.len());

        for (assignment, inflight) in in_flight.drain() {
            if dead_set.contains(&inflight.worker_id) {
                orphaned.push((inflight.task, inflight.worker_id));
            } else {
                healthy.insert(assignment, inflight);
            }
        }

        *in_flight = healthy;
    }

    // 3) Reencolar o fallar la corrida
    for (task, worker_id) in orphaned {
        let run_id = task.run_id.clone();
        let seed = task.seed;
        info!(
            "reencolando tarea {} (run={}, seed={}) por caída del worker {} (attempt={})",
            task.id,
            run_id,
            seed,
            worker_id,
            task.attempt + 1
        );

        if !state.retry_task(task, MAX_TASK_ATTEMPTS)? {
            warn!(
                "la semilla {} del run {} superó el máximo de intentos ({}) tras caída de worker {}",
                seed, run_id, MAX_TASK_ATTEMPTS, worker_id
            );
            state.fail_run(
                &run_id,
                RunState::Sampling,
                format!("la semilla {seed} agotó {MAX_TASK_ATTEMPTS} intentos por caídas de workers"),
            )?;
        }
    }

    Ok(())
}
