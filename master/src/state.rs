// master/src/state.rs

use chrono::Utc;
use common::{
    config::StoreSettings, AssignmentId, ObjectStore, RunId, RunInfo, RunState, RunStatus,
    SampleTask, WorkerId,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::SystemTime,
};
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<Mutex<HashMap<RunId, RunInfo>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // tareas pendientes de asignar
    pub tasks_queue: Arc<Mutex<VecDeque<SampleTask>>>,
    // tareas ya asignadas pero no completadas
    pub in_flight: Arc<Mutex<HashMap<AssignmentId, InFlight>>>,

    pub store: Arc<dyn ObjectStore>,
    pub settings: Arc<StoreSettings>,
}

impl AppState {
    pub fn new(store: Arc<dyn ObjectStore>, settings: StoreSettings) -> Self {
        Self {
            runs: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            tasks_queue: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            store,
            settings: Arc::new(settings),
        }
    }

    /// Marca la corrida como FAILED y descarta sus tareas todavía en cola.
    pub fn fail_run(&self, run_id: &RunId, stage: RunState, error: String) -> Result<(), String> {
        {
            let mut runs = self.runs.lock().map_err(|_| "lock runs")?;
            if let Some(run) = runs.get_mut(run_id) {
                if run.status.is_terminal() {
                    return Ok(());
                }
                warn!("run {} FAILED en {}: {}", run_id, stage, error);
                run.status = RunStatus::Failed;
                run.stage = Some(stage);
                run.error = Some(error);
                run.finished_at = Some(Utc::now());
            }
        }

        let mut queue = self.tasks_queue.lock().map_err(|_| "lock tasks_queue")?;
        let before = queue.len();
        queue.retain(|t| &t.run_id != run_id);
        if before != queue.len() {
            warn!(
                "descartadas {} tareas en cola del run {}",
                before - queue.len(),
                run_id
            );
        }
        Ok(())
    }

    /// Reencola una tarea con attempt+1 si no supera `max_attempts`.
    /// Devuelve false si ya no quedan intentos.
    pub fn retry_task(&self, mut task: SampleTask, max_attempts: u32) -> Result<bool, String> {
        if task.attempt + 1 > max_attempts {
            return Ok(false);
        }
        task.attempt += 1;

        {
            let mut runs = self.runs.lock().map_err(|_| "lock runs")?;
            match runs.get_mut(&task.run_id) {
                Some(run) if !run.status.is_terminal() => run.retries += 1,
                // la corrida ya terminó: no tiene sentido reintentar
                _ => return Ok(true),
            }
        }

        let mut queue = self.tasks_queue.lock().map_err(|_| "lock tasks_queue")?;
        queue.push_back(task);
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub task: SampleTask,
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
}
