//! Landscape: el registro relacional de auditoría (C4).
//!
//! Rol en el flujo:
//! - Todo lo que pasa por el DAG queda registrado aquí: runs, rows, tokens,
//!   parentesco, node_states, routing_events, outcomes, batches, llamadas.
//! - El trait `Landscape` define el contrato; `InMemoryLandscape` es la
//!   implementación de referencia (tests y runs efímeros) y el backend
//!   Postgres vive en `elspeth-persistence` con paridad 1:1.
//!
//! Propiedades operativas del contrato:
//! - Un solo outcome con `is_terminal = true` por token (índice único
//!   parcial en Postgres; chequeo explícito en memoria).
//! - Fork/expand registran hijos + outcome del padre en la MISMA transacción
//!   (cierra la ventana de crash entre "los hijos existen" y "el padre quedó
//!   FORKED").
//! - `node_states` es append-only; el cierre es una única transición
//!   pending → terminal.

pub mod memory;
pub mod payload;
pub mod types;

pub use memory::InMemoryLandscape;
pub use payload::{InMemoryPayloadStore, PayloadStore};
pub use types::*;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::RecorderError;

/// Contrato del audit store. Thread-safe: los workers comparten el handle.
pub trait Landscape: Send + Sync {
    // --- runs ---
    fn create_run(&self, run: &RunRecord) -> Result<(), RecorderError>;
    fn finish_run(&self, run_id: Uuid, status: RunStatus, finished_at: DateTime<Utc>) -> Result<(), RecorderError>;
    fn run(&self, run_id: Uuid) -> Result<RunRecord, RecorderError>;

    // --- rows ---
    fn record_row(&self, row: &RowRecord) -> Result<(), RecorderError>;
    fn rows_for_run(&self, run_id: Uuid) -> Result<Vec<RowRecord>, RecorderError>;

    // --- tokens ---
    /// Inserta un token con sus padres (vacío para tokens iniciales). El
    /// backend valida el parentesco: el padre debe existir, ser anterior al
    /// hijo y no ser descendiente suyo.
    fn insert_token(&self, token: &TokenRecord, parents: &[TokenParentRecord]) -> Result<(), RecorderError>;
    fn token(&self, token_id: Uuid) -> Result<TokenRecord, RecorderError>;
    fn tokens_for_run(&self, run_id: Uuid) -> Result<Vec<TokenRecord>, RecorderError>;
    fn parents_of(&self, token_id: Uuid) -> Result<Vec<TokenParentRecord>, RecorderError>;

    // --- outcomes ---
    /// Registra un outcome. Para `is_terminal = true` el backend garantiza
    /// unicidad por token (`RecorderError::DuplicateTerminal` en violación).
    fn record_outcome(&self, outcome: &OutcomeRecord) -> Result<(), RecorderError>;
    /// Fork/expand: inserta N hijos (con sus links de padre) y el outcome
    /// terminal del padre atómicamente.
    fn record_branching(&self,
                        parent_outcome: &OutcomeRecord,
                        children: &[TokenRecord],
                        parent_links: &[TokenParentRecord])
                        -> Result<(), RecorderError>;
    /// Coalesce: inserta el token fusionado (padres ordenados por llegada) y
    /// marca cada input COALESCED, todo en una transacción.
    fn record_coalesce(&self,
                       merged: &TokenRecord,
                       merged_parents: &[TokenParentRecord],
                       input_outcomes: &[OutcomeRecord])
                       -> Result<(), RecorderError>;
    fn outcomes_for_run(&self, run_id: Uuid) -> Result<Vec<OutcomeRecord>, RecorderError>;
    fn outcomes_for_token(&self, token_id: Uuid) -> Result<Vec<OutcomeRecord>, RecorderError>;
    fn terminal_outcome(&self, token_id: Uuid) -> Result<Option<OutcomeRecord>, RecorderError>;

    // --- node states ---
    fn open_node_state(&self, state: &NodeStateRecord) -> Result<(), RecorderError>;
    fn close_node_state(&self, state_id: Uuid, close: &NodeStateClose) -> Result<(), RecorderError>;
    fn node_states_for_token(&self, token_id: Uuid) -> Result<Vec<NodeStateRecord>, RecorderError>;

    // --- routing ---
    fn record_routing(&self, events: &[RoutingEventRecord]) -> Result<(), RecorderError>;
    fn routing_for_state(&self, state_id: Uuid) -> Result<Vec<RoutingEventRecord>, RecorderError>;

    // --- batches ---
    fn create_batch(&self, batch: &BatchRecord) -> Result<(), RecorderError>;
    fn add_batch_member(&self, member: &BatchMemberRecord) -> Result<(), RecorderError>;
    fn close_batch(&self, batch_id: Uuid, flushed_at: DateTime<Utc>) -> Result<(), RecorderError>;
    fn batch_members(&self, batch_id: Uuid) -> Result<Vec<BatchMemberRecord>, RecorderError>;

    // --- experiments ---
    fn record_assignment(&self, assignment: &ExperimentAssignmentRecord) -> Result<(), RecorderError>;
    fn assignments_for_row(&self, run_id: Uuid, row_id: &str) -> Result<Vec<ExperimentAssignmentRecord>, RecorderError>;

    // --- calls ---
    fn record_call(&self, call: &CallRecord) -> Result<(), RecorderError>;
}
