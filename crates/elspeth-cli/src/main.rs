//! elspeth: CLI mínima sobre el engine.
//!
//! Verbos:
//! - `validate`: parsea la configuración, construye y valida el grafo.
//! - `run`: ejecuta el pipeline (opcionalmente reanudando un run previo).
//! - `explain`: reconstruye el linaje de una fila o token desde el
//!   landscape.
//!
//! Códigos de salida: 0 éxito; 1 error de usuario (config inválida, nodo
//! inalcanzable, run desconocido); 2 error de runtime; 3 parcial (alguna
//! fila en cuarentena o fallida); 64 inesperado.

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use elspeth_adapters::builtin_registry;
use elspeth_core::config::PipelineSettings;
use elspeth_core::landscape::{InMemoryLandscape, Landscape, PayloadStore};
use elspeth_core::lineage;
use elspeth_core::recovery::RecoveryManager;
use elspeth_core::{InMemoryPayloadStore, Orchestrator, PipelineBuilder};
use elspeth_persistence::{build_pool, FsPayloadStore, PgLandscape, PoolProvider};

const EXIT_OK: i32 = 0;
const EXIT_USER_ERROR: i32 = 1;
const EXIT_RUNTIME_ERROR: i32 = 2;
const EXIT_PARTIAL: i32 = 3;
const EXIT_UNEXPECTED: i32 = 64;

#[derive(Parser)]
#[command(name = "elspeth", about = "Durable, auditable row-processing engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Valida la configuración y el grafo; no ejecuta nada.
    Validate {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Ejecuta el pipeline.
    Run {
        #[arg(long, short)]
        config: PathBuf,
        /// Run previo a reanudar: sólo se procesan sus filas sin terminar.
        #[arg(long)]
        resume: Option<Uuid>,
    },
    /// Imprime el linaje de una fila o token de un run.
    Explain {
        #[arg(long, short)]
        config: PathBuf,
        #[arg(long)]
        run: Uuid,
        #[arg(long, conflicts_with = "row")]
        token: Option<Uuid>,
        #[arg(long)]
        row: Option<String>,
    },
}

fn main() {
    env_logger::init();
    elspeth_persistence::init_dotenv();
    let cli = Cli::parse();

    let code = match std::panic::catch_unwind(|| dispatch(cli)) {
        Ok(code) => code,
        Err(_) => {
            eprintln!("error: unexpected panic");
            EXIT_UNEXPECTED
        }
    };
    exit(code);
}

fn dispatch(cli: Cli) -> i32 {
    match cli.command {
        Command::Validate { config } => validate(&config),
        Command::Run { config, resume } => run(&config, resume),
        Command::Explain { config, run, token, row } => explain(&config, run, token, row),
    }
}

fn load_settings(path: &PathBuf) -> Result<PipelineSettings, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let settings: PipelineSettings = serde_yaml::from_str(&text).map_err(|e| format!("invalid config: {e}"))?;
    settings.validate().map_err(|e| e.to_string())?;
    Ok(settings)
}

fn validate(path: &PathBuf) -> i32 {
    let settings = match load_settings(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_USER_ERROR;
        }
    };
    let registry = builtin_registry();
    match PipelineBuilder::from_settings(&settings, &registry) {
        Ok(pipeline) => {
            println!("configuration valid: {} nodes, {} edges",
                     pipeline.graph.nodes().count(),
                     pipeline.graph.edges().len());
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_USER_ERROR
        }
    }
}

/// Resuelve el landscape según la config: Postgres si hay URL (config o
/// entorno), in-memory si no.
fn open_landscape(settings: &PipelineSettings) -> Result<Arc<dyn Landscape>, String> {
    let url = settings.landscape
                      .database_url
                      .clone()
                      .or_else(|| std::env::var("DATABASE_URL").ok());
    match url {
        Some(url) => {
            let pool = build_pool(&url, 2, 16).map_err(|e| format!("landscape connection failed: {e}"))?;
            Ok(Arc::new(PgLandscape::new(PoolProvider { pool })))
        }
        None => Ok(Arc::new(InMemoryLandscape::new())),
    }
}

fn open_payloads(settings: &PipelineSettings) -> Result<Arc<dyn PayloadStore>, String> {
    match &settings.landscape.payload_dir {
        Some(dir) => Ok(Arc::new(FsPayloadStore::new(dir).map_err(|e| format!("payload store: {e}"))?)),
        None => Ok(Arc::new(InMemoryPayloadStore::new())),
    }
}

fn run(path: &PathBuf, resume: Option<Uuid>) -> i32 {
    let settings = match load_settings(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_USER_ERROR;
        }
    };
    let registry = builtin_registry();
    let pipeline = match PipelineBuilder::from_settings(&settings, &registry) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_USER_ERROR;
        }
    };
    let landscape = match open_landscape(&settings) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_RUNTIME_ERROR;
        }
    };
    let payloads = match open_payloads(&settings) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_RUNTIME_ERROR;
        }
    };

    let mut orchestrator = Orchestrator::new(pipeline,
                                             Arc::clone(&landscape),
                                             payloads,
                                             settings.execution.clone(),
                                             settings.fingerprint());
    if let Some(previous) = resume {
        let recovery = RecoveryManager::new(Arc::clone(&landscape));
        match recovery.plan_resume(previous) {
            Ok(plan) => {
                println!("resuming run {previous}: {} unprocessed rows", plan.unprocessed.len());
                orchestrator = orchestrator.with_resume_filter(plan.row_filter());
            }
            Err(e) => {
                eprintln!("error: cannot plan resume: {e}");
                return EXIT_USER_ERROR;
            }
        }
    }

    match orchestrator.run() {
        Ok(report) => {
            println!("run {} finished: {} rows read, {} completed, {} routed, {} coalesced, {} in batches, \
                      {} quarantined, {} failed",
                     report.run_id,
                     report.rows_read,
                     report.completed,
                     report.routed,
                     report.coalesced,
                     report.consumed_in_batch,
                     report.quarantined,
                     report.failed);
            if report.aborted {
                EXIT_RUNTIME_ERROR
            } else if report.is_partial() {
                EXIT_PARTIAL
            } else {
                EXIT_OK
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_RUNTIME_ERROR
        }
    }
}

fn explain(path: &PathBuf, run_id: Uuid, token: Option<Uuid>, row: Option<String>) -> i32 {
    let settings = match load_settings(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_USER_ERROR;
        }
    };
    let landscape = match open_landscape(&settings) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_RUNTIME_ERROR;
        }
    };
    let report = match (token, row) {
        (Some(token_id), _) => lineage::explain_token(&landscape, run_id, token_id),
        (None, Some(row_id)) => lineage::explain_row(&landscape, run_id, &row_id),
        (None, None) => {
            eprintln!("error: explain requires --token or --row");
            return EXIT_USER_ERROR;
        }
    };
    match report {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    eprintln!("error: {e}");
                    return EXIT_UNEXPECTED;
                }
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_USER_ERROR
        }
    }
}
