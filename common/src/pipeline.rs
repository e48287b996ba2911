//! Corrida completa en proceso:
//!
//! ```text
//! SEEDING -> SAMPLING (n tareas en paralelo) -> BARRIER -> FINDING
//!         -> GATHERING -> REDUCING -> PERSISTING -> DONE
//! ```
//!
//! Ningún estado se revisita. Cualquier falla antes de la barrera aborta las
//! tareas pendientes y la corrida; no se produce una estimación parcial.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{info, warn};

use crate::collect::{ResultFinder, ResultGatherer, ResultSink, RESULT_PATTERN};
use crate::error::{PipelineError, RunFailure};
use crate::keys::{final_key, key_for, RunContext, RunId, StorageKey, TaskId, RESULT_FILE};
use crate::reduce::reduce;
use crate::sample::Sampler;
use crate::seeds;
use crate::store::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Seeding,
    Sampling,
    Barrier,
    Finding,
    Gathering,
    Reducing,
    Persisting,
    Done,
    Failed,
}

impl RunState {
    pub const ALL: [RunState; 9] = [
        RunState::Seeding,
        RunState::Sampling,
        RunState::Barrier,
        RunState::Finding,
        RunState::Gathering,
        RunState::Reducing,
        RunState::Persisting,
        RunState::Done,
        RunState::Failed,
    ];
}

// Mismo nombre que usa serde: variantes de una palabra en mayúsculas.
impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format!("{self:?}").to_ascii_uppercase())
    }
}

/// Lleva el estado actual de una corrida y loguea cada transición.
#[derive(Debug, Clone)]
pub struct RunTracker {
    run_id: RunId,
    trace: Vec<RunState>,
}

impl RunTracker {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            trace: Vec::new(),
        }
    }

    pub fn enter(&mut self, state: RunState) {
        match self.trace.last() {
            Some(prev) => info!("run {}: {} -> {}", self.run_id, prev, state),
            None => info!("run {}: {}", self.run_id, state),
        }
        self.trace.push(state);
    }

    pub fn current(&self) -> Option<RunState> {
        self.trace.last().copied()
    }

    pub fn trace(&self) -> &[RunState] {
        &self.trace
    }

    /// Marca la corrida como fallida en la etapa actual.
    pub fn fail(&mut self, source: PipelineError) -> RunFailure {
        let stage = self.current().unwrap_or(RunState::Seeding);
        warn!("run {} falló en {}: {}", self.run_id, stage, source);
        self.trace.push(RunState::Failed);
        RunFailure::new(self.run_id.clone(), stage, source)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Tareas de muestreo simultáneas.
    pub max_concurrency: usize,
    /// Intentos por escritura ante fallas transitorias (misma clave siempre).
    pub put_attempts: u32,
    pub put_backoff: Duration,
    /// Regex que identifica resultados bajo el prefijo de semillas.
    pub result_pattern: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            put_attempts: 3,
            put_backoff: Duration::from_millis(50),
            result_pattern: RESULT_PATTERN.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub context: RunContext,
    pub estimate: f64,
    pub samples: usize,
    pub final_key: StorageKey,
    pub trace: Vec<RunState>,
}

pub struct Pipeline {
    store: Arc<dyn ObjectStore>,
    sampler: Arc<dyn Sampler>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(store: Arc<dyn ObjectStore>, sampler: Arc<dyn Sampler>) -> Self {
        Self {
            store,
            sampler,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn run(&self, ctx: &RunContext, n_samples: i64) -> Result<RunOutcome, RunFailure> {
        let mut tracker = RunTracker::new(ctx.run_id.clone());

        tracker.enter(RunState::Seeding);
        let seeds = seeds::generate(n_samples).map_err(|e| tracker.fail(e))?;

        tracker.enter(RunState::Sampling);
        let expected = self
            .scatter(ctx, &seeds)
            .await
            .map_err(|e| tracker.fail(e))?;

        tracker.enter(RunState::Barrier);
        info!(
            "run {}: {} resultados durables en {}",
            ctx.run_id,
            expected.len(),
            ctx.seeds_prefix()
        );

        let (estimate, final_key) = finish_run(
            &self.store,
            ctx,
            &expected,
            &self.options.result_pattern,
            &mut tracker,
        )
        .await?;

        Ok(RunOutcome {
            context: ctx.clone(),
            estimate,
            samples: seeds.len(),
            final_key,
            trace: tracker.trace().to_vec(),
        })
    }

    /// Lanza una tarea (muestra + escritura) por semilla y espera a todas.
    /// Devuelve las claves escritas. Ante la primera falla aborta el resto.
    async fn scatter(
        &self,
        ctx: &RunContext,
        seeds: &[TaskId],
    ) -> Result<BTreeSet<StorageKey>, PipelineError> {
        let sem = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let sink = ResultSink::new(self.store.clone());
        let mut expected = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for &seed in seeds {
            let key = key_for(ctx, seed, RESULT_FILE)?;
            expected.insert(key.clone());

            let sem = sem.clone();
            let sink = sink.clone();
            let sampler = self.sampler.clone();
            let bucket = ctx.bucket.clone();
            let attempts = self.options.put_attempts;
            let backoff = self.options.put_backoff;

            tasks.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|_| PipelineError::Internal("semáforo cerrado".into()))?;
                let result = sampler.sample(seed);
                sink.put_with_retry(&bucket, &key, result.value(), attempts, backoff)
                    .await?;
                Ok::<TaskId, PipelineError>(seed)
            });
        }

        // Barrera: no se sigue hasta que todas las tareas terminaron.
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e,
                Err(e) => PipelineError::Internal(format!("tarea de muestreo abortada: {e}")),
            };
            tasks.abort_all();
            return Err(failure);
        }

        Ok(expected)
    }
}

/// FINDING -> GATHERING -> REDUCING -> PERSISTING -> DONE.
///
/// Sólo debe llamarse después de la barrera. El conjunto encontrado tiene que
/// coincidir exactamente con `expected`; si falta o sobra algo la corrida falla.
pub async fn finish_run(
    store: &Arc<dyn ObjectStore>,
    ctx: &RunContext,
    expected: &BTreeSet<StorageKey>,
    pattern: &str,
    tracker: &mut RunTracker,
) -> Result<(f64, StorageKey), RunFailure> {
    tracker.enter(RunState::Finding);
    let found = ResultFinder::new(store.clone())
        .find(&ctx.bucket, &ctx.seeds_prefix(), pattern)
        .await
        .map_err(|e| tracker.fail(e))?;

    if found != *expected {
        let missing: Vec<&StorageKey> = expected.difference(&found).collect();
        let unexpected: Vec<&StorageKey> = found.difference(expected).collect();
        let first = missing
            .first()
            .or(unexpected.first())
            .map(|k| k.to_string())
            .unwrap_or_default();
        return Err(tracker.fail(PipelineError::aggregation(
            first,
            format!(
                "resultados incompletos: esperados {}, encontrados {}, faltan {}, inesperados {}",
                expected.len(),
                found.len(),
                missing.len(),
                unexpected.len()
            ),
        )));
    }

    tracker.enter(RunState::Gathering);
    let values = ResultGatherer::new(store.clone())
        .gather(&ctx.bucket, &found)
        .await
        .map_err(|e| tracker.fail(e))?;

    tracker.enter(RunState::Reducing);
    let estimate = reduce(&values).map_err(|e| tracker.fail(e))?;

    tracker.enter(RunState::Persisting);
    let key = final_key(ctx).map_err(|e| tracker.fail(e))?;
    ResultSink::new(store.clone())
        .put(&ctx.bucket, &key, estimate)
        .await
        .map_err(|e| tracker.fail(e))?;

    tracker.enter(RunState::Done);
    info!(
        "run {}: estimación {} con {} muestras -> {}",
        ctx.run_id,
        estimate,
        values.len(),
        key
    );
    Ok((estimate, key))
}
