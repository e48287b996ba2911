use anyhow::{Context, Result};
use common::{
    collect::ResultSink,
    config::{env_parse, StoreSettings},
    MonteCarloSampler, PipelineError, SampleTask, Sampler, TaskAssignmentRequest,
    TaskAssignmentResponse, TaskCompleteRequest, WorkerHeartbeatRequest, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::Client;
use std::{sync::Arc, time::Duration};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const PUT_ATTEMPTS: u32 = 3;
const PUT_BACKOFF: Duration = Duration::from_millis(200);

/// Muestrea la semilla de la tarea y deja el hit en la clave asignada.
pub(crate) async fn execute_task(
    sampler: Arc<dyn Sampler>,
    sink: &ResultSink,
    task: &SampleTask,
) -> Result<f64, PipelineError> {
    let seed = task.seed;
    let sample = tokio::task::spawn_blocking(move || sampler.sample(seed))
        .await
        .map_err(|e| PipelineError::Internal(format!("muestreo de {seed} abortado: {e}")))?;

    let value = sample.value();
    debug!(
        "semilla {}: x={:.4} y={:.4} hit={}",
        seed, sample.x, sample.y, sample.hit
    );
    sink.put_with_retry(&task.bucket, &task.key, value, PUT_ATTEMPTS, PUT_BACKOFF)
        .await?;
    Ok(value)
}

/// CPU global (%) y memoria usada en bytes, tal como las reporta sysinfo.
fn usage(sys: &System) -> (f32, u64) {
    (sys.global_cpu_info().cpu_usage(), sys.used_memory())
}

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos.
/// - Pide tareas mientras tenga "slots" libres.
/// - Ejecuta cada tarea en paralelo (hasta WORKER_CONCURRENCY).
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,reqwest=info")),
        )
        .init();

    let base_url: String = env_parse("MASTER_URL", "http://localhost:8080".to_string());
    let client = Client::new();

    let settings = StoreSettings::from_env().context("configuración de store inválida")?;
    let sink = ResultSink::new(settings.build_store()?);
    let sampler: Arc<dyn Sampler> = Arc::new(MonteCarloSampler);

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let max_concurrency: u32 =
        env_parse("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY).max(1);
    let concurrency: usize = max_concurrency as usize;

    // Registro de worker (enviando max_concurrency)
    let register_url = format!("{}/api/v1/workers/register", base_url);
    let res = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname,
            max_concurrency,
        })
        .send()
        .await
        .with_context(|| format!("no se pudo contactar al master en {base_url}"))?;
    let WorkerRegisterResponse { worker_id } = res.error_for_status()?.json().await?;

    info!(
        "worker {} registrado con concurrency={} contra {} (store {:?})",
        worker_id, concurrency, base_url, settings.backend
    );

    let sem = Arc::new(Semaphore::new(concurrency));

    // System para leer CPU y memoria
    let mut sys = System::new_all();

    loop {
        // --------- Heartbeat al master con CPU/MEM ---------
        sys.refresh_cpu();
        sys.refresh_memory();

        let (cpu_percent, mem_bytes) = usage(&sys);

        let hb_url = format!("{}/api/v1/workers/heartbeat", base_url);
        if let Err(e) = client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
                cpu_percent: Some(cpu_percent),
                mem_bytes: Some(mem_bytes),
            })
            .send()
            .await
        {
            warn!("heartbeat falló: {}", e);
        }

        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        // Pedimos tarea al master
        let assign_url = format!("{}/api/v1/tasks/next", base_url);
        let assignment: TaskAssignmentResponse = match client
            .post(&assign_url)
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await
            .and_then(|res| res.error_for_status())
        {
            Ok(res) => res.json().await?,
            Err(e) => {
                drop(permit);
                warn!("no se pudo pedir tarea: {}", e);
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let Some(task) = assignment.task else {
            // No hay tarea: devolvemos el permiso y dormimos
            drop(permit);
            debug!("worker {} pidió tarea pero no hay", worker_id);
            sleep(Duration::from_secs(2)).await;
            continue;
        };

        info!(
            "tengo tarea {} del run {} (seed={} attempt={} key={})",
            task.id, task.run_id, task.seed, task.attempt, task.key
        );

        // Clonar lo que usamos en la tarea asíncrona
        let client_cloned = client.clone();
        let base_url_cloned = base_url.clone();
        let sink_cloned = sink.clone();
        let sampler_cloned = sampler.clone();

        tokio::spawn(async move {
            let outcome = execute_task(sampler_cloned, &sink_cloned, &task).await;
            let (success, error) = match outcome {
                Ok(value) => {
                    info!("terminé tarea {} (seed={} valor={})", task.id, task.seed, value);
                    (true, None)
                }
                Err(e) => {
                    warn!("error procesando tarea {}: {}", task.id, e);
                    (false, Some(e.to_string()))
                }
            };

            // Reportar al master que terminamos
            let complete_url = format!("{}/api/v1/tasks/complete", base_url_cloned);
            if let Err(e) = client_cloned
                .post(&complete_url)
                .json(&TaskCompleteRequest {
                    task_id: task.id.clone(),
                    success,
                    error,
                })
                .send()
                .await
            {
                warn!("no se pudo reportar la tarea {}: {}", task.id, e);
            }

            // Liberar el "slot" de concurrencia al terminar
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{key_for, keys::RESULT_FILE, MemoryStore, ObjectStore, RunContext, TaskId};

    fn task(ctx: &RunContext, seed: u64) -> SampleTask {
        SampleTask {
            id: "a1".to_string(),
            run_id: ctx.run_id.clone(),
            seed: TaskId::new(seed),
            attempt: 0,
            bucket: ctx.bucket.clone(),
            key: key_for(ctx, TaskId::new(seed), RESULT_FILE).unwrap(),
        }
    }

    #[test]
    fn memoria_reportada_no_supera_la_total() {
        let mut sys = System::new();
        sys.refresh_memory();
        let (_, mem_bytes) = usage(&sys);
        assert!(mem_bytes <= sys.total_memory());
        assert_eq!(mem_bytes, sys.used_memory());
    }

    #[tokio::test]
    async fn execute_task_escribe_el_hit_en_la_clave_asignada() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let sink = ResultSink::new(store.clone());
        let ctx = RunContext::new("b", "runs").unwrap();
        let t = task(&ctx, 10);

        let value = execute_task(Arc::new(MonteCarloSampler), &sink, &t)
            .await
            .unwrap();
        assert!(value == 0.0 || value == 4.0);

        let raw = store.get("b", &t.key).await.unwrap();
        assert_eq!(common::codec::decode_value(&raw).unwrap(), value);
    }

    #[tokio::test]
    async fn reintento_de_la_misma_tarea_sobrescribe_sin_duplicar() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let sink = ResultSink::new(store.clone());
        let ctx = RunContext::new("b", "runs").unwrap();
        let mut t = task(&ctx, 11);

        let first = execute_task(Arc::new(MonteCarloSampler), &sink, &t).await.unwrap();
        t.attempt = 1;
        let second = execute_task(Arc::new(MonteCarloSampler), &sink, &t).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.list("b", &ctx.seeds_prefix()).await.unwrap().len(), 1);
    }
}
