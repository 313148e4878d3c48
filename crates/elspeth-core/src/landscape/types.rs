//! Filas del esquema relacional del landscape (§3 del modelo de datos).
//!
//! Estas structs son el shape neutro que comparten el backend in-memory y el
//! backend Postgres. El core nunca persiste datos de fila más allá de hashes
//! de contenido y blobs opcionales del payload store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Estado de un run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Aborted => "aborted",
        }
    }
}

/// Una invocación del pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Hash canónico de la configuración + versión del engine.
    pub config_fingerprint: String,
}

/// Registro lógico de entrada. `row_id` se deriva de posición + hash de
/// contenido, por lo que un resume reutiliza los mismos ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowRecord {
    pub row_id: String,
    pub run_id: Uuid,
    pub source_position: u64,
    pub content_hash: String,
}

/// Unidad de flujo: esta fila, en esta posición del DAG, en este branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: Uuid,
    pub row_id: String,
    pub fork_group_id: Option<Uuid>,
    pub join_group_id: Option<Uuid>,
    pub expand_group_id: Option<Uuid>,
    pub branch_name: Option<String>,
    pub step_in_pipeline: u32,
    pub created_at: DateTime<Utc>,
}

/// Link padre → hijo, ordenado por `ordinal`. Inmutable una vez registrado.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenParentRecord {
    pub token_id: Uuid,
    pub parent_token_id: Uuid,
    pub ordinal: u32,
}

/// Estado de un node_state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateStatus {
    Pending,
    Completed,
    Failed,
}

impl NodeStateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStateStatus::Pending => "pending",
            NodeStateStatus::Completed => "completed",
            NodeStateStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeStateStatus::Pending)
    }
}

/// Intento de ejecución de (token, nodo). Append-only; los retries abren
/// attempts nuevos, nunca sobreescriben.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStateRecord {
    pub state_id: Uuid,
    pub token_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    pub status: NodeStateStatus,
    pub input_hash: String,
    pub output_hash: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_json: Option<Value>,
    pub success_reason_json: Option<Value>,
    pub context_before_json: Option<Value>,
    pub context_after_json: Option<Value>,
}

/// Cierre de un node_state: transición única pending → terminal.
#[derive(Debug, Clone)]
pub struct NodeStateClose {
    pub status: NodeStateStatus,
    pub output_hash: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error_json: Option<Value>,
    pub success_reason_json: Option<Value>,
    pub context_after_json: Option<Value>,
}

/// Modo de un routing event (espejo del modo del edge elegido).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoutingMode {
    Move,
    Copy,
    Divert,
}

impl RoutingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingMode::Move => "MOVE",
            RoutingMode::Copy => "COPY",
            RoutingMode::Divert => "DIVERT",
        }
    }
}

/// Un destino elegido en una decisión de gate. Todos los events de la misma
/// decisión comparten `routing_group_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEventRecord {
    pub event_id: Uuid,
    pub routing_group_id: Uuid,
    pub state_id: Uuid,
    pub edge_id: String,
    pub mode: RoutingMode,
    pub reason_json: Option<Value>,
}

/// Disposición terminal (o BUFFERED, el único outcome no terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOutcomeKind {
    Buffered,
    Completed,
    Routed,
    Forked,
    Expanded,
    Coalesced,
    ConsumedInBatch,
    Failed,
    Quarantined,
}

impl TokenOutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenOutcomeKind::Buffered => "buffered",
            TokenOutcomeKind::Completed => "completed",
            TokenOutcomeKind::Routed => "routed",
            TokenOutcomeKind::Forked => "forked",
            TokenOutcomeKind::Expanded => "expanded",
            TokenOutcomeKind::Coalesced => "coalesced",
            TokenOutcomeKind::ConsumedInBatch => "consumed_in_batch",
            TokenOutcomeKind::Failed => "failed",
            TokenOutcomeKind::Quarantined => "quarantined",
        }
    }
}

/// Registro de outcome de un token. La unicidad del outcome terminal (un
/// solo `is_terminal = true` por token) la garantiza el backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub outcome_id: Uuid,
    pub run_id: Uuid,
    pub token_id: Uuid,
    pub outcome: TokenOutcomeKind,
    pub is_terminal: bool,
    pub sink_name: Option<String>,
    pub batch_id: Option<Uuid>,
    pub fork_group_id: Option<Uuid>,
    pub join_group_id: Option<Uuid>,
    pub expand_group_id: Option<Uuid>,
    pub error_hash: Option<String>,
    /// Contrato de branch para fork (lista de nombres) y expand (conteo
    /// prometido de filas). Recovery lo cruza con los hijos vivos.
    pub expected_branches_json: Option<Value>,
    pub context_json: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

impl OutcomeRecord {
    /// Outcome terminal mínimo; el caller completa los campos de detalle.
    pub fn terminal(run_id: Uuid, token_id: Uuid, outcome: TokenOutcomeKind) -> Self {
        Self { outcome_id: Uuid::new_v4(),
               run_id,
               token_id,
               outcome,
               is_terminal: true,
               sink_name: None,
               batch_id: None,
               fork_group_id: None,
               join_group_id: None,
               expand_group_id: None,
               error_hash: None,
               expected_branches_json: None,
               context_json: None,
               recorded_at: Utc::now() }
    }
}

/// Agrupación de una aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub flushed_at: Option<DateTime<Utc>>,
}

/// Membresía de un token de entrada en un batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMemberRecord {
    pub batch_id: Uuid,
    pub token_id: Uuid,
    pub ordinal: u32,
}

/// Asignación de experimento por fila (opcional).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentAssignmentRecord {
    pub run_id: Uuid,
    pub row_id: String,
    pub experiment_id: String,
    pub variant_id: String,
    /// Overrides de opciones de transform aplicados por esta variante.
    pub overrides_json: Option<Value>,
    pub assigned_at: DateTime<Utc>,
}

/// Llamada externa registrada por un plugin (request/response por hash).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: Uuid,
    pub run_id: Uuid,
    pub token_id: Uuid,
    pub node_id: String,
    pub service: String,
    pub request_hash: String,
    pub response_hash: String,
    pub status: String,
    pub recorded_at: DateTime<Utc>,
}
