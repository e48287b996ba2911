//! Barrera por corrida: cuenta regresiva de tareas de muestreo. Cuando no
//! queda ninguna en cola ni en vuelo y todas terminaron bien, el master hace
//! FINDING -> GATHERING -> REDUCING -> PERSISTING por su cuenta.

use std::collections::BTreeSet;

use chrono::Utc;
use common::{
    collect::RESULT_PATTERN,
    key_for,
    keys::RESULT_FILE,
    pipeline::{finish_run, RunTracker},
    seeds, RunId, RunState, RunStatus, StorageKey,
};
use tracing::{info, warn};

use crate::state::AppState;

/// ¿Quedan tareas de esta corrida en cola o en vuelo?
pub fn has_pending(state: &AppState, run_id: &RunId) -> Result<bool, String> {
    let queued = {
        let queue = state.tasks_queue.lock().map_err(|_| "lock tasks_queue")?;
        queue.iter().any(|t| &t.run_id == run_id)
    };
    if queued {
        return Ok(true);
    }

    let in_flight = state.in_flight.lock().map_err(|_| "lock in_flight")?;
    Ok(in_flight.values().any(|it| &it.task.run_id == run_id))
}

/// Registra una tarea exitosa. Devuelve true si con ella se alcanzó la barrera
/// (en ese caso la corrida ya quedó en REDUCING y hay que finalizarla).
pub fn on_task_succeeded(state: &AppState, run_id: &RunId) -> Result<bool, String> {
    {
        let mut runs = state.runs.lock().map_err(|_| "lock runs")?;
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.completed_tasks += 1;
    }

    if has_pending(state, run_id)? {
        return Ok(false);
    }

    let mut runs = state.runs.lock().map_err(|_| "lock runs")?;
    let Some(run) = runs.get_mut(run_id) else {
        return Ok(false);
    };
    if run.status.is_terminal()
        || run.status == RunStatus::Reducing
        || run.completed_tasks < run.total_tasks
    {
        return Ok(false);
    }

    info!(
        "run {}: barrera alcanzada ({}/{} tareas)",
        run_id, run.completed_tasks, run.total_tasks
    );
    run.status = RunStatus::Reducing;
    run.stage = Some(RunState::Barrier);
    Ok(true)
}

/// Recolecta, reduce y persiste el resultado final de una corrida.
pub async fn finalize_run(state: AppState, run_id: RunId) {
    let snapshot = {
        let runs = match state.runs.lock() {
            Ok(runs) => runs,
            Err(_) => {
                warn!("lock runs envenenado, no se puede finalizar {}", run_id);
                return;
            }
        };
        runs.get(&run_id).map(|r| (r.context.clone(), r.n_samples))
    };
    let Some((ctx, n_samples)) = snapshot else {
        warn!("run {} desapareció antes de finalizar", run_id);
        return;
    };

    let expected: Result<BTreeSet<StorageKey>, _> = seeds::generate(n_samples).and_then(|seeds| {
        seeds
            .into_iter()
            .map(|seed| key_for(&ctx, seed, RESULT_FILE))
            .collect()
    });
    let expected = match expected {
        Ok(keys) => keys,
        Err(e) => {
            if let Err(lock_err) = state.fail_run(&run_id, RunState::Finding, e.to_string()) {
                warn!("no se pudo marcar run {} como fallido: {}", run_id, lock_err);
            }
            return;
        }
    };

    let mut tracker = RunTracker::new(run_id.clone());
    tracker.enter(RunState::Barrier);
    let outcome = finish_run(&state.store, &ctx, &expected, RESULT_PATTERN, &mut tracker).await;

    match outcome {
        Ok((estimate, key)) => {
            let Ok(mut runs) = state.runs.lock() else {
                warn!("lock runs envenenado al cerrar {}", run_id);
                return;
            };
            if let Some(run) = runs.get_mut(&run_id) {
                run.status = RunStatus::Succeeded;
                run.stage = Some(RunState::Done);
                run.estimate = Some(estimate);
                run.final_key = Some(key);
                run.finished_at = Some(Utc::now());
            }
        }
        Err(failure) => {
            if let Err(lock_err) = state.fail_run(&run_id, failure.stage, failure.to_string()) {
                warn!("no se pudo marcar run {} como fallido: {}", run_id, lock_err);
            }
        }
    }
}
