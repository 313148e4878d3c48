//! elspeth-core: motor durable y auditable de procesamiento de filas.
//!
//! Propósito:
//! - Un pipeline configurado lee filas de una fuente, empuja cada fila por
//!   un DAG de transforms, gates, aggregations y coalesce, y escribe a uno o
//!   más sinks.
//! - Todo token que fluye por el DAG queda registrado en el "Landscape"
//!   (store relacional de auditoría) y toda fila alcanza exactamente un
//!   outcome terminal (completed, routed, forked, expanded, coalesced,
//!   quarantined, failed o consumed-in-batch).
//!
//! Componentes principales:
//! - `schema`: campos tipados y compatibilidad productor → consumidor.
//! - `plugin`: contratos de capacidades (source, transform, gate, sink) y
//!   registry de factories.
//! - `graph`: DAG tipado con edges MOVE/COPY/DIVERT, builder y validación.
//! - `landscape`: el audit store (trait + backend in-memory + payload store);
//!   el backend Postgres vive en `elspeth-persistence`.
//! - `token`: manager de ciclo de vida (fork/expand/coalesce atómicos).
//! - `processor`: ejecución de un (token, nodo) con retries y clasificación.
//! - `orchestrator`: pool de workers, backpressure, barreras y triggers.
//! - `recovery`: derivación de filas sin procesar de un run previo.
//! - `lineage`: reconstrucción "explain" desde el landscape.
//! - `hashing`: canonicalización JSON y hashes de contenido.
//!
//! Sin estado global: el alcance del run viaja en contextos explícitos.

pub mod config;
pub mod constants;
pub mod errors;
pub mod experiment;
pub mod graph;
pub mod hashing;
pub mod landscape;
pub mod lineage;
pub mod orchestrator;
pub mod plugin;
pub mod processor;
pub mod ratelimit;
pub mod recovery;
pub mod schema;
pub mod telemetry;
pub mod token;

// Re-exports públicos principales
pub use config::PipelineSettings;
pub use errors::{ConfigError, EngineError, RecorderError};
pub use graph::{BuiltPipeline, EdgeMode, ExecutionGraph, GraphEdge, GraphNode, NodeKind, PipelineBuilder};
pub use landscape::{InMemoryLandscape, InMemoryPayloadStore, Landscape, PayloadStore, TokenOutcomeKind};
pub use orchestrator::{CancelFlag, Orchestrator, RunReport};
pub use plugin::{GatePlugin, PluginContext, PluginRegistry, SinkPlugin, SourcePlugin, TransformPlugin, TransformResult};
pub use processor::{RowProcessor, StepOutcome, WorkItem};
pub use recovery::{RecoveryManager, RecoveryPlan};
pub use schema::{missing_required_fields, FieldDef, FieldType, Schema};
pub use token::TokenManager;
