use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::{
    codec::decode_value, final_key, key_for, keys::RESULT_FILE, seeds, PipelineError,
    RunContext, RunId, RunInfo, RunRequest, RunResults, RunState, RunStatus, SampleTask,
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::barrier;
use crate::state::{AppState, InFlight, WorkerMeta};
use crate::MAX_TASK_ATTEMPTS;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/runs", post(create_run))
        .route("/api/v1/runs/:id", get(get_run))
        .route("/api/v1/runs/:id/results", get(get_run_results))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StatusCode> {
    m.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Crea una corrida nueva y encola una tarea de muestreo por semilla
pub(crate) async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunInfo>, ApiError> {
    enqueue_run(&state, req).map(Json)
}

pub(crate) fn enqueue_run(state: &AppState, req: RunRequest) -> Result<RunInfo, ApiError> {
    let seeds =
        seeds::generate(req.n_samples).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    let base_prefix = req
        .base_prefix
        .clone()
        .unwrap_or_else(|| state.settings.base_prefix.clone());
    let ctx = RunContext::new(&state.settings.bucket, &base_prefix)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    let mut tasks_for_run: Vec<SampleTask> = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let key = key_for(&ctx, seed, RESULT_FILE)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
        tasks_for_run.push(SampleTask {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: ctx.run_id.clone(),
            seed,
            attempt: 0,
            bucket: ctx.bucket.clone(),
            key,
        });
    }

    let run_info = RunInfo {
        id: ctx.run_id.clone(),
        name: req.name,
        status: RunStatus::Accepted,
        stage: Some(RunState::Sampling),
        context: ctx.clone(),
        n_samples: req.n_samples,

        submitted_at: Utc::now(),
        started_at: None,
        finished_at: None,
        total_tasks: tasks_for_run.len() as u32,
        completed_tasks: 0,
        failed_tasks: 0,
        retries: 0,

        estimate: None,
        final_key: None,
        error: None,
    };

    info!(
        "run {} creado: {} tareas bajo {}/{}",
        ctx.run_id,
        run_info.total_tasks,
        ctx.bucket,
        ctx.run_prefix()
    );

    {
        let mut runs = lock(&state.runs).map_err(|s| api_error(s, "lock runs"))?;
        runs.insert(ctx.run_id.clone(), run_info.clone());
    }
    {
        let mut queue = lock(&state.tasks_queue).map_err(|s| api_error(s, "lock tasks_queue"))?;
        queue.extend(tasks_for_run);
    }

    Ok(run_info)
}

// Devuelve info de una corrida
pub(crate) async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunInfo>, StatusCode> {
    let run_id = RunId::parse(&id).map_err(|_| StatusCode::NOT_FOUND)?;
    let runs = lock(&state.runs)?;

    runs.get(&run_id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// Lista los objetos de una corrida en el store y el resultado final si ya existe
pub(crate) async fn get_run_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunResults>, StatusCode> {
    let run_id = RunId::parse(&id).map_err(|_| StatusCode::NOT_FOUND)?;
    let ctx = {
        let runs = lock(&state.runs)?;
        runs.get(&run_id)
            .map(|r| r.context.clone())
            .ok_or(StatusCode::NOT_FOUND)?
    };

    let run_prefix = ctx.run_prefix();
    let keys = state.store.list(&ctx.bucket, &run_prefix).await.map_err(|e| {
        warn!("no se pudo listar {}: {}", run_prefix, e);
        StatusCode::BAD_GATEWAY
    })?;

    let final_key = final_key(&ctx).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let estimate = match state.store.get(&ctx.bucket, &final_key).await {
        Ok(raw) => Some(decode_value(&raw).map_err(|e| {
            warn!("resultado final ilegible en {}: {}", final_key, e);
            StatusCode::BAD_GATEWAY
        })?),
        Err(PipelineError::ObjectNotFound(_)) => None,
        Err(e) => {
            warn!("no se pudo leer {}: {}", final_key, e);
            return Err(StatusCode::BAD_GATEWAY);
        }
    };

    Ok(Json(RunResults {
        run_id,
        bucket: ctx.bucket,
        run_prefix,
        keys,
        estimate,
    }))
}

// Registra un worker nuevo
pub(crate) async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Result<Json<WorkerRegisterResponse>, StatusCode> {
    let worker_id = uuid::Uuid::new_v4().to_string();
    let max_concurrency = req.max_concurrency.max(1);

    {
        let mut workers = lock(&state.workers)?;
        workers.insert(
            worker_id.clone(),
            WorkerMeta {
                hostname: req.hostname,
                last_heartbeat: SystemTime::now(),
                dead: false,
                max_concurrency,

                tasks_started: 0,
                tasks_succeeded: 0,
                tasks_failed: 0,
                total_task_time_ms: 0,

                last_cpu_percent: None,
                last_mem_bytes: None,
            },
        );
    }

    info!(
        "worker registrado: {} (max_concurrency={})",
        worker_id, max_concurrency
    );
    Ok(Json(WorkerRegisterResponse { worker_id }))
}

// Heartbeat de worker
pub(crate) async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let mut workers = lock(&state.workers)?;
    let meta = workers.get_mut(&req.worker_id).ok_or(StatusCode::NOT_FOUND)?;

    meta.last_heartbeat = SystemTime::now();
    if meta.dead {
        info!("worker {} volvió a dar señales de vida", req.worker_id);
        meta.dead = false;
    }
    meta.last_cpu_percent = req.cpu_percent;
    meta.last_mem_bytes = req.mem_bytes;
    Ok(Json(WorkerHeartbeatResponse { ok: true }))
}

// Asigna la siguiente tarea en cola (si hay)
pub(crate) async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Result<Json<TaskAssignmentResponse>, StatusCode> {
    // 1) Cuántas tareas tiene ya este worker en vuelo
    let active_for_worker: usize = {
        let in_flight = lock(&state.in_flight)?;
        in_flight
            .values()
            .filter(|entry| entry.worker_id == req.worker_id)
            .count()
    };

    // 2) Capacidad máxima de este worker; un worker desconocido no recibe tareas
    let max_for_worker: u32 = {
        let workers = lock(&state.workers)?;
        match workers.get(&req.worker_id) {
            Some(meta) if !meta.dead => meta.max_concurrency,
            _ => return Err(StatusCode::NOT_FOUND),
        }
    };

    if active_for_worker as u32 >= max_for_worker {
        info!(
            "worker {} pidió tarea pero ya tiene {}/{} en vuelo",
            req.worker_id, active_for_worker, max_for_worker
        );
        return Ok(Json(TaskAssignmentResponse { task: None }));
    }

    // 3) Sacar la siguiente tarea de la cola global
    let task_opt = {
        let mut queue = lock(&state.tasks_queue)?;
        queue.pop_front()
    };

    let Some(task) = task_opt else {
        return Ok(Json(TaskAssignmentResponse { task: None }));
    };

    info!(
        "asignando tarea {} (run={}, seed={}, key={}, attempt={}) al worker {} ({}/{} en vuelo -> +1)",
        task.id,
        task.run_id,
        task.seed,
        task.key,
        task.attempt,
        req.worker_id,
        active_for_worker,
        max_for_worker,
    );

    // 4) Registrar la tarea en in_flight con timestamp de inicio
    {
        let mut in_flight = lock(&state.in_flight)?;
        in_flight.insert(
            task.id.clone(),
            InFlight {
                task: task.clone(),
                worker_id: req.worker_id.clone(),
                started_at: SystemTime::now(),
            },
        );
    }

    // 5) Marcar la corrida como Running la primera vez
    {
        let mut runs = lock(&state.runs)?;
        if let Some(run) = runs.get_mut(&task.run_id) {
            if run.status == RunStatus::Accepted {
                run.status = RunStatus::Running;
                if run.started_at.is_none() {
                    run.started_at = Some(Utc::now());
                }
            }
        }
    }

    // 6) Métricas del worker
    {
        let mut workers = lock(&state.workers)?;
        if let Some(meta) = workers.get_mut(&req.worker_id) {
            meta.tasks_started += 1;
        }
    }

    Ok(Json(TaskAssignmentResponse { task: Some(task) }))
}

// Worker reporta que terminó una tarea
pub(crate) async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Result<Json<TaskCompleteResponse>, StatusCode> {
    // Sacar la tarea de in_flight
    let inflight = {
        let mut in_flight = lock(&state.in_flight)?;
        in_flight.remove(&req.task_id).ok_or(StatusCode::NOT_FOUND)?
    };

    let task = inflight.task;
    let run_id = task.run_id.clone();

    // ---- Métricas de worker: duración de la tarea ----
    let duration_ms: u64 = inflight
        .started_at
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    {
        let mut workers = lock(&state.workers)?;
        if let Some(meta) = workers.get_mut(&inflight.worker_id) {
            meta.total_task_time_ms += duration_ms;
            if req.success {
                meta.tasks_succeeded += 1;
            } else {
                meta.tasks_failed += 1;
            }
        }
    }

    // ---- Caso fallo: reintento con la misma clave o corrida FAILED ----
    if !req.success {
        let reason = req.error.unwrap_or_else(|| "sin detalle".to_string());
        warn!(
            "tarea {} (run={}, seed={}) falló en attempt {}: {}",
            task.id, run_id, task.seed, task.attempt, reason
        );

        {
            let mut runs = lock(&state.runs)?;
            if let Some(run) = runs.get_mut(&run_id) {
                run.failed_tasks += 1;
            }
        }

        let seed = task.seed;
        let retried = state.retry_task(task, MAX_TASK_ATTEMPTS).map_err(|e| {
            warn!("{}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        if !retried {
            state
                .fail_run(
                    &run_id,
                    RunState::Sampling,
                    format!("la semilla {seed} agotó {MAX_TASK_ATTEMPTS} intentos: {reason}"),
                )
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        }
        return Ok(Json(TaskCompleteResponse { ok: true }));
    }

    // ---- Caso éxito: cuenta regresiva de la barrera ----
    let reached = barrier::on_task_succeeded(&state, &run_id).map_err(|e| {
        warn!("{}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if reached {
        tokio::spawn(barrier::finalize_run(state.clone(), run_id));
    }

    Ok(Json(TaskCompleteResponse { ok: true }))
}

pub(crate) async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkerMetrics>>, StatusCode> {
    let now = SystemTime::now();

    // Contar tareas activas por worker (desde in_flight)
    let mut active_by_worker: HashMap<WorkerId, u32> = HashMap::new();
    {
        let in_flight = lock(&state.in_flight)?;
        for inf in in_flight.values() {
            *active_by_worker.entry(inf.worker_id.clone()).or_insert(0) += 1;
        }
    }

    let workers = lock(&state.workers)?;
    let mut out = Vec::with_capacity(workers.len());

    for (wid, meta) in workers.iter() {
        let age_secs = now
            .duration_since(meta.last_heartbeat)
            .unwrap_or_default()
            .as_secs();

        let finished = meta.tasks_succeeded + meta.tasks_failed;
        let avg_ms = if finished > 0 {
            Some(meta.total_task_time_ms as f64 / finished as f64)
        } else {
            None
        };

        out.push(WorkerMetrics {
            worker_id: wid.clone(),
            hostname: meta.hostname.clone(),
            dead: meta.dead,
            max_concurrency: meta.max_concurrency,
            last_heartbeat_secs_ago: age_secs,
            active_tasks: active_by_worker.get(wid).copied().unwrap_or(0),
            tasks_started: meta.tasks_started,
            tasks_succeeded: meta.tasks_succeeded,
            tasks_failed: meta.tasks_failed,
            avg_task_ms: avg_ms,
            cpu_percent: meta.last_cpu_percent,
            mem_bytes: meta.last_mem_bytes,
        });
    }

    out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    Ok(Json(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_state, state_with_run, task_for};
    use axum::body::Body;
    use axum::http::Request;
    use common::collect::ResultSink;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn register(state: &AppState, max_concurrency: u32) -> WorkerId {
        register_worker(
            State(state.clone()),
            Json(WorkerRegisterRequest {
                hostname: "test".to_string(),
                max_concurrency,
            }),
        )
        .await
        .unwrap()
        .0
        .worker_id
    }

    async fn next(state: &AppState, worker_id: &str) -> Option<SampleTask> {
        assign_task(
            State(state.clone()),
            Json(TaskAssignmentRequest {
                worker_id: worker_id.to_string(),
            }),
        )
        .await
        .unwrap()
        .0
        .task
    }

    async fn complete(state: &AppState, task: &SampleTask, success: bool) {
        complete_task(
            State(state.clone()),
            Json(TaskCompleteRequest {
                task_id: task.id.clone(),
                success,
                error: (!success).then(|| "store caído".to_string()),
            }),
        )
        .await
        .unwrap();
    }

    async fn wait_terminal(state: &AppState, run_id: &RunId) -> RunInfo {
        for _ in 0..200 {
            let info = state.runs.lock().unwrap()[run_id].clone();
            if info.status.is_terminal() {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("el run {run_id} no terminó a tiempo");
    }

    #[tokio::test]
    async fn create_run_rechaza_cantidades_invalidas() {
        let state = memory_state();
        for n in [0, -3, 1_000_001] {
            let (status, body) = create_run(
                State(state.clone()),
                Json(RunRequest {
                    name: "pi".into(),
                    n_samples: n,
                    base_prefix: None,
                }),
            )
            .await
            .unwrap_err();
            assert_eq!(status, StatusCode::BAD_REQUEST, "n={n}");
            assert!(!body.0.error.is_empty());
        }
        assert!(state.runs.lock().unwrap().is_empty());
        assert!(state.tasks_queue.lock().unwrap().is_empty());
    }

    #[test]
    fn create_run_encola_una_tarea_por_semilla_con_claves_distintas() {
        let (state, ctx) = state_with_run(3);
        let queue = state.tasks_queue.lock().unwrap();
        let keys: Vec<&str> = queue.iter().map(|t| t.key.as_str()).collect();

        assert_eq!(
            keys,
            vec![
                format!("runs/{}/seeds/10/result.out", ctx.run_id),
                format!("runs/{}/seeds/11/result.out", ctx.run_id),
                format!("runs/{}/seeds/12/result.out", ctx.run_id),
            ]
        );
        assert!(queue.iter().all(|t| t.attempt == 0 && t.bucket == ctx.bucket));

        let run = &state.runs.lock().unwrap()[&ctx.run_id];
        assert_eq!(run.status, RunStatus::Accepted);
        assert_eq!(run.total_tasks, 3);
    }

    #[tokio::test]
    async fn assign_respeta_max_concurrency_del_worker() {
        let (state, ctx) = state_with_run(3);
        let worker = register(&state, 2).await;

        assert!(next(&state, &worker).await.is_some());
        assert!(next(&state, &worker).await.is_some());
        assert!(next(&state, &worker).await.is_none());

        assert_eq!(state.tasks_queue.lock().unwrap().len(), 1);
        assert_eq!(
            state.runs.lock().unwrap()[&ctx.run_id].status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn assign_a_worker_desconocido_es_404() {
        let (state, _) = state_with_run(1);
        let res = assign_task(
            State(state),
            Json(TaskAssignmentRequest {
                worker_id: "nadie".into(),
            }),
        )
        .await;
        assert_eq!(res.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tarea_fallida_se_reintenta_con_la_misma_clave() {
        let (state, ctx) = state_with_run(1);
        let worker = register(&state, 1).await;
        let task = next(&state, &worker).await.unwrap();

        complete(&state, &task, false).await;

        let retried = task_for(&state, 0);
        assert_eq!(retried.key, task.key);
        assert_eq!(retried.attempt, 1);

        let run = &state.runs.lock().unwrap()[&ctx.run_id];
        assert_eq!(run.failed_tasks, 1);
        assert_eq!(run.retries, 1);
        assert!(!run.status.is_terminal());
    }

    #[tokio::test]
    async fn agotar_reintentos_marca_el_run_como_fallido() {
        let (state, ctx) = state_with_run(2);
        let worker = register(&state, 4).await;

        // la semilla 11 queda en vuelo; la 10 falla en todos sus intentos
        let mut held = None;
        let mut failures = 0;
        while let Some(task) = next(&state, &worker).await {
            if task.seed.value() == 10 {
                complete(&state, &task, false).await;
                failures += 1;
            } else {
                held = Some(task);
            }
        }
        assert_eq!(failures, MAX_TASK_ATTEMPTS + 1);

        let run = state.runs.lock().unwrap()[&ctx.run_id].clone();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage, Some(RunState::Sampling));
        assert!(run.error.unwrap().contains("10"));
        assert!(state.tasks_queue.lock().unwrap().is_empty());

        // un éxito tardío no revive la corrida
        complete(&state, &held.unwrap(), true).await;
        assert_eq!(
            state.runs.lock().unwrap()[&ctx.run_id].status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn barrera_dispara_la_reduccion_y_persistencia() {
        let (state, ctx) = state_with_run(4);
        let worker = register(&state, 4).await;
        let sink = ResultSink::new(state.store.clone());

        let mut tasks = Vec::new();
        while let Some(task) = next(&state, &worker).await {
            tasks.push(task);
        }
        assert_eq!(tasks.len(), 4);

        for (task, hit) in tasks.iter().zip([4.0, 4.0, 0.0, 0.0]) {
            sink.put(&task.bucket, &task.key, hit).await.unwrap();
            complete(&state, task, true).await;
        }

        let run = wait_terminal(&state, &ctx.run_id).await;
        assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error);
        assert_eq!(run.stage, Some(RunState::Done));
        assert_eq!(run.estimate, Some(2.0));
        assert_eq!(run.completed_tasks, 4);

        let results = get_run_results(State(state.clone()), Path(ctx.run_id.to_string()))
            .await
            .unwrap()
            .0;
        assert_eq!(results.estimate, Some(2.0));
        assert_eq!(results.keys.len(), 5);
        assert_eq!(run.final_key, Some(final_key(&ctx).unwrap()));
    }

    #[tokio::test]
    async fn barrera_sin_resultado_en_el_store_falla_en_finding() {
        let (state, ctx) = state_with_run(2);
        let worker = register(&state, 2).await;
        let sink = ResultSink::new(state.store.clone());

        let first = next(&state, &worker).await.unwrap();
        let second = next(&state, &worker).await.unwrap();
        sink.put(&first.bucket, &first.key, 4.0).await.unwrap();
        // el segundo reporta éxito pero nunca escribió
        complete(&state, &first, true).await;
        complete(&state, &second, true).await;

        let run = wait_terminal(&state, &ctx.run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage, Some(RunState::Finding));
        assert!(run.estimate.is_none());
    }

    #[tokio::test]
    async fn results_de_run_inexistente_es_404() {
        let state = memory_state();
        let res = get_run_results(State(state.clone()), Path("no-existe".into())).await;
        assert_eq!(res.unwrap_err(), StatusCode::NOT_FOUND);
        let res = get_run(State(state), Path("../x".into())).await;
        assert_eq!(res.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn heartbeat_actualiza_metricas_del_worker() {
        let state = memory_state();
        let worker = register(&state, 0).await;

        worker_heartbeat(
            State(state.clone()),
            Json(WorkerHeartbeatRequest {
                worker_id: worker.clone(),
                cpu_percent: Some(12.5),
                mem_bytes: Some(1024),
            }),
        )
        .await
        .unwrap();

        let metrics = list_workers(State(state)).await.unwrap().0;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].max_concurrency, 1);
        assert_eq!(metrics[0].cpu_percent, Some(12.5));
        assert_eq!(metrics[0].mem_bytes, Some(1024));
    }

    #[tokio::test]
    async fn router_expone_health_y_runs() {
        let app = build_router(memory_state());

        let res = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .oneshot(
                Request::post("/api/v1/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"pi","n_samples":0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
