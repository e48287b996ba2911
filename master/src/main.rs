mod barrier;
mod failover;
mod handlers;
mod state;

use crate::state::AppState;
use anyhow::Context;
use common::config::{env_parse, StoreSettings};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const WORKER_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
pub const FAILOVER_SWEEP_INTERVAL_SECS: u64 = 5;
pub const MAX_TASK_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,axum=info")),
        )
        .init();

    let settings = StoreSettings::from_env().context("configuración de store inválida")?;
    let store = settings.build_store().context("no se pudo construir el store")?;
    info!(
        "store {:?} (bucket={}, prefijo base={})",
        settings.backend, settings.bucket, settings.base_prefix
    );

    let state = AppState::new(store, settings);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // failover de workers en segundo plano
    tokio::spawn(failover::run_failover_loop(state.clone()));

    let addr: String = env_parse("MASTER_ADDR", "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {addr}"))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod test_support {
    use std::sync::Arc;

    use common::{config::StoreSettings, MemoryStore, RunContext, RunRequest, SampleTask};

    use crate::handlers::enqueue_run;
    use crate::state::AppState;

    pub fn memory_state() -> AppState {
        let settings = StoreSettings::from_lookup(|name| {
            (name == "STORE_BACKEND").then(|| "memory".to_string())
        })
        .unwrap();
        AppState::new(Arc::new(MemoryStore::new()), settings)
    }

    /// Estado con una corrida de `n` semillas ya encolada.
    pub fn state_with_run(n: i64) -> (AppState, RunContext) {
        let state = memory_state();
        let info = enqueue_run(
            &state,
            RunRequest {
                name: "pi".to_string(),
                n_samples: n,
                base_prefix: None,
            },
        )
        .unwrap();
        (state, info.context)
    }

    pub fn task_for(state: &AppState, idx: usize) -> SampleTask {
        state.tasks_queue.lock().unwrap()[idx].clone()
    }
}
