use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    config::{env_parse, StoreBackend, StoreSettings},
    MonteCarloSampler, Pipeline, PipelineOptions, RunContext, RunInfo, RunOutcome, RunRequest,
    RunResults, WorkerMetrics,
};
use reqwest::Client;
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env_parse("MASTER_URL", "http://localhost:8080".to_string())
}

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "CLI para lanzar corridas de Monte Carlo y consultar al master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Envía una corrida nueva al master
    Submit {
        #[arg(value_name = "NOMBRE")]
        name: String,

        /// Cantidad de muestras (una tarea por semilla)
        #[arg(long, allow_negative_numbers = true)]
        samples: i64,

        /// Prefijo base dentro del bucket (default: el del master)
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Consulta el estado de una corrida
    Status {
        #[arg(value_name = "RUN_ID")]
        id: String,
    },
    /// Lista los objetos de una corrida y su resultado final
    Results {
        #[arg(value_name = "RUN_ID")]
        id: String,
    },

    Workers,

    /// Ejecuta una corrida completa en este proceso, sin master
    Local {
        #[arg(long, allow_negative_numbers = true)]
        samples: i64,

        /// memory | local | mc (default: STORE_BACKEND)
        #[arg(long)]
        store: Option<StoreBackend>,

        #[arg(long)]
        bucket: Option<String>,

        #[arg(long)]
        prefix: Option<String>,

        /// Directorio raíz para el store local (default: STORE_ROOT)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Tareas de muestreo simultáneas
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

struct LocalArgs {
    samples: i64,
    store: Option<StoreBackend>,
    bucket: Option<String>,
    prefix: Option<String>,
    root: Option<PathBuf>,
    concurrency: Option<usize>,
}

async fn run_local(mut settings: StoreSettings, args: LocalArgs) -> Result<RunOutcome> {
    if let Some(backend) = args.store {
        settings.backend = backend;
    }
    if let Some(bucket) = args.bucket {
        settings.bucket = bucket;
    }
    if let Some(prefix) = args.prefix {
        settings.base_prefix = prefix;
    }
    if let Some(root) = args.root {
        settings.root = root;
    }

    let store = settings.build_store()?;
    let ctx = RunContext::new(&settings.bucket, &settings.base_prefix)?;

    let mut options = PipelineOptions::default();
    if let Some(n) = args.concurrency {
        options.max_concurrency = n.max(1);
    }

    let pipeline = Pipeline::new(store, Arc::new(MonteCarloSampler)).with_options(options);
    let outcome = pipeline.run(&ctx, args.samples).await?;
    Ok(outcome)
}

fn print_run(run: &RunInfo) {
    println!("Run:");
    println!("  id: {}", run.id);
    println!("  nombre: {}", run.name);
    println!("  estado: {:?}", run.status);
    if let Some(stage) = run.stage {
        println!("  etapa: {}", stage);
    }
    println!("  bucket: {}", run.context.bucket);
    println!("  prefijo: {}", run.context.run_prefix());

    println!(
        "  tareas: total={}, completadas={}, fallidas={}, reintentos={}",
        run.total_tasks, run.completed_tasks, run.failed_tasks, run.retries
    );
    if run.total_tasks > 0 {
        let pct = (run.completed_tasks as f64 / run.total_tasks as f64) * 100.0;
        println!("  progreso: {:.1}%", pct);
    }

    println!("  submitted_at: {}", run.submitted_at);
    if let Some(ref started) = run.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = run.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(estimate) = run.estimate {
        println!("  estimación: {}", estimate);
    }
    if let Some(ref key) = run.final_key {
        println!("  resultado en: {}", key);
    }
    if let Some(ref error) = run.error {
        println!("  error: {}", error);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("common=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit {
            name,
            samples,
            prefix,
        } => {
            let url = format!("{}/api/v1/runs", base_url);
            let req = RunRequest {
                name,
                n_samples: samples,
                base_prefix: prefix,
            };

            let resp = client.post(&url).json(&req).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("el master rechazó la corrida (status {status}): {body}");
            }
            let run: RunInfo = resp.json().await?;
            println!("Run creado:");
            print_run(&run);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/runs/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let run: RunInfo = resp.json().await?;
                print_run(&run);
            } else {
                println!("Error: run no encontrado (status {})", resp.status());
            }
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/runs/{id}/results", base_url);
            let resp = client.get(&url).send().await?;

            if resp.status().is_success() {
                let results: RunResults = resp.json().await?;
                println!("Resultados para run {}:", results.run_id);
                println!("  bucket: {}", results.bucket);
                println!("  prefijo: {}", results.run_prefix);
                match results.estimate {
                    Some(v) => println!("  estimación: {}", v),
                    None => println!("  estimación: (todavía no persistida)"),
                }
                if results.keys.is_empty() {
                    println!("  (sin objetos)");
                } else {
                    println!("  objetos:");
                    for k in results.keys {
                        println!("    - {}", k);
                    }
                }
            } else {
                println!(
                    "No se encontraron resultados para run {id} (status {})",
                    resp.status()
                );
            }
        }

        Commands::Local {
            samples,
            store,
            bucket,
            prefix,
            root,
            concurrency,
        } => {
            let settings = StoreSettings::from_env().context("configuración de store inválida")?;
            let outcome = run_local(
                settings,
                LocalArgs {
                    samples,
                    store,
                    bucket,
                    prefix,
                    root,
                    concurrency,
                },
            )
            .await?;

            println!("Run local {} completado:", outcome.context.run_id);
            println!("  muestras: {}", outcome.samples);
            println!("  estimación: {}", outcome.estimate);
            println!(
                "  resultado en: {}/{}",
                outcome.context.bucket, outcome.final_key
            );
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay workers registrados.");
                } else {
                    for w in workers {
                        println!("Worker {}", w.worker_id);
                        println!("  host           : {}", w.hostname);
                        println!("  dead           : {}", w.dead);
                        println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                        println!(
                            "  concurrency    : max={} activas={}",
                            w.max_concurrency, w.active_tasks
                        );
                        println!(
                            "  tareas         : started={}, ok={}, failed={}",
                            w.tasks_started, w.tasks_succeeded, w.tasks_failed
                        );
                        match w.avg_task_ms {
                            Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
                            None => println!("  avg_task_ms    : (sin datos)"),
                        }
                        match w.cpu_percent {
                            Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
                            None => println!("  cpu_percent    : (sin datos)"),
                        }
                        match w.mem_bytes {
                            Some(mem) => println!("  mem_bytes      : {}", mem),
                            None => println!("  mem_bytes      : (sin datos)"),
                        }
                        println!();
                    }
                }
            } else {
                println!(
                    "Error consultando /api/v1/workers (status {})",
                    resp.status()
                );
            }
        }
    }

    Ok(())
}
