//! Implementación Postgres (Diesel) del `Landscape` del core.
//!
//! Objetivo:
//! - Paridad 1:1 con el backend in-memory: mismos invariantes, mismos
//!   errores semánticos.
//! - El invariante de outcome terminal único lo da el índice único parcial
//!   `token_outcomes_one_terminal`; la violación se traduce a
//!   `RecorderError::DuplicateTerminal`.
//! - Las mutaciones compuestas (fork/expand, coalesce, flush de batch) van
//!   en UNA transacción `build_transaction().read_write()`: cierra la
//!   ventana de crash entre "los hijos existen" y "el padre quedó FORKED".
//! - Errores transitorios (deadlock, serialización, pool) se reintentan con
//!   backoff corto.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use log::{debug, warn};
use serde_json::Value;
use uuid::Uuid;

use elspeth_core::errors::RecorderError;
use elspeth_core::landscape::{BatchMemberRecord, BatchRecord, CallRecord, ExperimentAssignmentRecord, Landscape,
                              NodeStateClose, NodeStateRecord, NodeStateStatus, OutcomeRecord, RoutingEventRecord,
                              RoutingMode, RowRecord, RunRecord, RunStatus, TokenOutcomeKind, TokenParentRecord,
                              TokenRecord};

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;
use crate::schema::{batch_members, batches, calls, experiment_assignments, node_states, routing_events, rows,
                    token_outcomes, token_parents, tokens, runs};

/// Alias del pool r2d2 de conexiones Postgres. Al construirlo se corren las
/// migraciones pendientes una sola vez.
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones (pool real en producción; fácil de
/// factorear en tests).
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, PersistenceError>;
}

/// Provider respaldado por un `PgPool`.
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

/// Errores que conviene reintentar con backoff.
fn is_retryable(e: &PersistenceError) -> bool {
    match e {
        PersistenceError::SerializationConflict => true,
        PersistenceError::TransientIo(_) => true,
        PersistenceError::Unknown(msg) => {
            let m = msg.to_lowercase();
            m.contains("deadlock detected")
            || m.contains("could not serialize access due to concurrent update")
            || m.contains("connection closed")
            || m.contains("connection refused")
            || m.contains("timeout")
        }
        _ => false,
    }
}

/// Retry con backoff lineal corto (hasta 3 intentos).
fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("retryable landscape error (attempt {}): {:?} -> sleeping {}ms",
                      attempts + 1,
                      e,
                      delay_ms);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

// --- filas Diesel ---

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = runs)]
struct RunRow {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: String,
    config_fingerprint: String,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = rows)]
struct RowRow {
    row_id: String,
    run_id: Uuid,
    source_position: i64,
    content_hash: String,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = tokens)]
struct TokenRow {
    token_id: Uuid,
    row_id: String,
    fork_group_id: Option<Uuid>,
    join_group_id: Option<Uuid>,
    expand_group_id: Option<Uuid>,
    branch_name: Option<String>,
    step_in_pipeline: i32,
    created_at: DateTime<Utc>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = token_parents)]
struct TokenParentRow {
    token_id: Uuid,
    parent_token_id: Uuid,
    ordinal: i32,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = node_states)]
struct NodeStateRow {
    state_id: Uuid,
    token_id: Uuid,
    node_id: String,
    attempt: i32,
    status: String,
    input_hash: String,
    output_hash: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    error_json: Option<Value>,
    success_reason_json: Option<Value>,
    context_before_json: Option<Value>,
    context_after_json: Option<Value>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = routing_events)]
struct RoutingEventRow {
    event_id: Uuid,
    routing_group_id: Uuid,
    state_id: Uuid,
    edge_id: String,
    mode: String,
    reason_json: Option<Value>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = token_outcomes)]
struct OutcomeRow {
    outcome_id: Uuid,
    run_id: Uuid,
    token_id: Uuid,
    outcome: String,
    is_terminal: bool,
    sink_name: Option<String>,
    batch_id: Option<Uuid>,
    fork_group_id: Option<Uuid>,
    join_group_id: Option<Uuid>,
    expand_group_id: Option<Uuid>,
    error_hash: Option<String>,
    expected_branches_json: Option<Value>,
    context_json: Option<Value>,
    recorded_at: DateTime<Utc>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = batches)]
struct BatchRow {
    batch_id: Uuid,
    run_id: Uuid,
    node_id: String,
    status: String,
    created_at: DateTime<Utc>,
    flushed_at: Option<DateTime<Utc>>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = batch_members)]
struct BatchMemberRow {
    batch_id: Uuid,
    token_id: Uuid,
    ordinal: i32,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = experiment_assignments)]
struct AssignmentRow {
    run_id: Uuid,
    row_id: String,
    experiment_id: String,
    variant_id: String,
    overrides_json: Option<Value>,
    assigned_at: DateTime<Utc>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = calls)]
struct CallRow {
    call_id: Uuid,
    run_id: Uuid,
    token_id: Uuid,
    node_id: String,
    service: String,
    request_hash: String,
    response_hash: String,
    status: String,
    recorded_at: DateTime<Utc>,
}

// --- conversiones dominio ↔ fila ---

fn run_to_row(run: &RunRecord) -> RunRow {
    RunRow { run_id: run.run_id,
             started_at: run.started_at,
             finished_at: run.finished_at,
             status: run.status.as_str().to_string(),
             config_fingerprint: run.config_fingerprint.clone() }
}

fn run_from_row(row: RunRow) -> Result<RunRecord, RecorderError> {
    Ok(RunRecord { run_id: row.run_id,
                   started_at: row.started_at,
                   finished_at: row.finished_at,
                   status: parse_run_status(&row.status)?,
                   config_fingerprint: row.config_fingerprint })
}

fn parse_run_status(text: &str) -> Result<RunStatus, RecorderError> {
    match text {
        "running" => Ok(RunStatus::Running),
        "finished" => Ok(RunStatus::Finished),
        "aborted" => Ok(RunStatus::Aborted),
        other => Err(RecorderError::Storage(format!("unknown run status '{other}'"))),
    }
}

fn parse_node_status(text: &str) -> Result<NodeStateStatus, RecorderError> {
    match text {
        "pending" => Ok(NodeStateStatus::Pending),
        "completed" => Ok(NodeStateStatus::Completed),
        "failed" => Ok(NodeStateStatus::Failed),
        other => Err(RecorderError::Storage(format!("unknown node state status '{other}'"))),
    }
}

fn parse_outcome_kind(text: &str) -> Result<TokenOutcomeKind, RecorderError> {
    match text {
        "buffered" => Ok(TokenOutcomeKind::Buffered),
        "completed" => Ok(TokenOutcomeKind::Completed),
        "routed" => Ok(TokenOutcomeKind::Routed),
        "forked" => Ok(TokenOutcomeKind::Forked),
        "expanded" => Ok(TokenOutcomeKind::Expanded),
        "coalesced" => Ok(TokenOutcomeKind::Coalesced),
        "consumed_in_batch" => Ok(TokenOutcomeKind::ConsumedInBatch),
        "failed" => Ok(TokenOutcomeKind::Failed),
        "quarantined" => Ok(TokenOutcomeKind::Quarantined),
        other => Err(RecorderError::Storage(format!("unknown outcome '{other}'"))),
    }
}

fn parse_routing_mode(text: &str) -> Result<RoutingMode, RecorderError> {
    match text {
        "MOVE" => Ok(RoutingMode::Move),
        "COPY" => Ok(RoutingMode::Copy),
        "DIVERT" => Ok(RoutingMode::Divert),
        other => Err(RecorderError::Storage(format!("unknown routing mode '{other}'"))),
    }
}

fn token_to_row(token: &TokenRecord) -> TokenRow {
    TokenRow { token_id: token.token_id,
               row_id: token.row_id.clone(),
               fork_group_id: token.fork_group_id,
               join_group_id: token.join_group_id,
               expand_group_id: token.expand_group_id,
               branch_name: token.branch_name.clone(),
               step_in_pipeline: token.step_in_pipeline as i32,
               created_at: token.created_at }
}

fn token_from_row(row: TokenRow) -> TokenRecord {
    TokenRecord { token_id: row.token_id,
                  row_id: row.row_id,
                  fork_group_id: row.fork_group_id,
                  join_group_id: row.join_group_id,
                  expand_group_id: row.expand_group_id,
                  branch_name: row.branch_name,
                  step_in_pipeline: row.step_in_pipeline as u32,
                  created_at: row.created_at }
}

fn outcome_to_row(outcome: &OutcomeRecord) -> OutcomeRow {
    OutcomeRow { outcome_id: outcome.outcome_id,
                 run_id: outcome.run_id,
                 token_id: outcome.token_id,
                 outcome: outcome.outcome.as_str().to_string(),
                 is_terminal: outcome.is_terminal,
                 sink_name: outcome.sink_name.clone(),
                 batch_id: outcome.batch_id,
                 fork_group_id: outcome.fork_group_id,
                 join_group_id: outcome.join_group_id,
                 expand_group_id: outcome.expand_group_id,
                 error_hash: outcome.error_hash.clone(),
                 expected_branches_json: outcome.expected_branches_json.clone(),
                 context_json: outcome.context_json.clone(),
                 recorded_at: outcome.recorded_at }
}

fn outcome_from_row(row: OutcomeRow) -> Result<OutcomeRecord, RecorderError> {
    Ok(OutcomeRecord { outcome_id: row.outcome_id,
                       run_id: row.run_id,
                       token_id: row.token_id,
                       outcome: parse_outcome_kind(&row.outcome)?,
                       is_terminal: row.is_terminal,
                       sink_name: row.sink_name,
                       batch_id: row.batch_id,
                       fork_group_id: row.fork_group_id,
                       join_group_id: row.join_group_id,
                       expand_group_id: row.expand_group_id,
                       error_hash: row.error_hash,
                       expected_branches_json: row.expected_branches_json,
                       context_json: row.context_json,
                       recorded_at: row.recorded_at })
}

fn node_state_to_row(state: &NodeStateRecord) -> NodeStateRow {
    NodeStateRow { state_id: state.state_id,
                   token_id: state.token_id,
                   node_id: state.node_id.clone(),
                   attempt: state.attempt as i32,
                   status: state.status.as_str().to_string(),
                   input_hash: state.input_hash.clone(),
                   output_hash: state.output_hash.clone(),
                   started_at: state.started_at,
                   completed_at: state.completed_at,
                   duration_ms: state.duration_ms,
                   error_json: state.error_json.clone(),
                   success_reason_json: state.success_reason_json.clone(),
                   context_before_json: state.context_before_json.clone(),
                   context_after_json: state.context_after_json.clone() }
}

fn node_state_from_row(row: NodeStateRow) -> Result<NodeStateRecord, RecorderError> {
    Ok(NodeStateRecord { state_id: row.state_id,
                         token_id: row.token_id,
                         node_id: row.node_id,
                         attempt: row.attempt as u32,
                         status: parse_node_status(&row.status)?,
                         input_hash: row.input_hash,
                         output_hash: row.output_hash,
                         started_at: row.started_at,
                         completed_at: row.completed_at,
                         duration_ms: row.duration_ms,
                         error_json: row.error_json,
                         success_reason_json: row.success_reason_json,
                         context_before_json: row.context_before_json,
                         context_after_json: row.context_after_json })
}

/// Traduce la violación del índice único parcial a la variante semántica
/// del core.
fn map_outcome_insert_error(e: PersistenceError, token_id: Uuid) -> RecorderError {
    match e {
        PersistenceError::UniqueViolation(_) => RecorderError::DuplicateTerminal(token_id),
        other => other.into_recorder(),
    }
}

/// Inserción de un outcome dentro de una transacción ya abierta.
fn insert_outcome(conn: &mut PgConnection, outcome: &OutcomeRecord) -> Result<(), diesel::result::Error> {
    diesel::insert_into(token_outcomes::table).values(outcome_to_row(outcome))
                                              .execute(conn)
                                              .map(|_| ())
}

/// Chequeo de parentesco dentro de la transacción: el padre debe existir y
/// no ser más joven que el hijo (sin back-edges hacia tokens posteriores).
fn check_parent_links(conn: &mut PgConnection,
                      child: &TokenRecord,
                      links: &[TokenParentRecord])
                      -> Result<(), RecorderError> {
    for link in links {
        let parent: Option<TokenRow> = tokens::table.filter(tokens::token_id.eq(link.parent_token_id))
                                                    .first(conn)
                                                    .optional()
                                                    .map_err(|e| PersistenceError::from(e).into_recorder())?;
        let parent = parent.ok_or(RecorderError::UnknownToken(link.parent_token_id))?;
        if parent.created_at > child.created_at {
            return Err(RecorderError::InvalidParentLink { token: child.token_id,
                                                          reason: format!("parent {} is younger than child",
                                                                          link.parent_token_id) });
        }
    }
    Ok(())
}

/// Implementación Postgres del `Landscape`.
pub struct PgLandscape<P: ConnectionProvider> {
    pub provider: P,
}

impl<P: ConnectionProvider> PgLandscape<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, RecorderError> {
        self.provider.connection().map_err(PersistenceError::into_recorder)
    }

    /// Ejecuta `f` dentro de una transacción read-write con retry ante
    /// errores transitorios.
    fn transaction<T>(&self,
                      f: impl Fn(&mut PgConnection) -> Result<T, diesel::result::Error>)
                      -> Result<T, PersistenceError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| f(tx))
                .map_err(PersistenceError::from)
        })
    }
}

impl<P: ConnectionProvider> Landscape for PgLandscape<P> {
    fn create_run(&self, run: &RunRecord) -> Result<(), RecorderError> {
        debug!("create_run {}", run.run_id);
        self.transaction(|conn| {
                diesel::insert_into(runs::table).values(run_to_row(run)).execute(conn).map(|_| ())
            })
            .map_err(PersistenceError::into_recorder)
    }

    fn finish_run(&self, run_id: Uuid, status: RunStatus, finished_at: DateTime<Utc>) -> Result<(), RecorderError> {
        let updated = self.transaction(|conn| {
                              diesel::update(runs::table.filter(runs::run_id.eq(run_id)))
                                  .set((runs::status.eq(status.as_str()), runs::finished_at.eq(Some(finished_at))))
                                  .execute(conn)
                          })
                          .map_err(PersistenceError::into_recorder)?;
        if updated == 0 {
            return Err(RecorderError::UnknownRun(run_id));
        }
        Ok(())
    }

    fn run(&self, run_id: Uuid) -> Result<RunRecord, RecorderError> {
        let mut conn = self.conn()?;
        let row: Option<RunRow> = runs::table.filter(runs::run_id.eq(run_id))
                                             .first(&mut conn)
                                             .optional()
                                             .map_err(|e| PersistenceError::from(e).into_recorder())?;
        row.ok_or(RecorderError::UnknownRun(run_id)).and_then(run_from_row)
    }

    fn record_row(&self, row: &RowRecord) -> Result<(), RecorderError> {
        self.transaction(|conn| {
                diesel::insert_into(rows::table).values(RowRow { row_id: row.row_id.clone(),
                                                                 run_id: row.run_id,
                                                                 source_position: row.source_position as i64,
                                                                 content_hash: row.content_hash.clone() })
                                                .on_conflict_do_nothing()
                                                .execute(conn)
                                                .map(|_| ())
            })
            .map_err(PersistenceError::into_recorder)
    }

    fn rows_for_run(&self, run_id: Uuid) -> Result<Vec<RowRecord>, RecorderError> {
        let mut conn = self.conn()?;
        let loaded: Vec<RowRow> = rows::table.filter(rows::run_id.eq(run_id))
                                             .order(rows::source_position.asc())
                                             .load(&mut conn)
                                             .map_err(|e| PersistenceError::from(e).into_recorder())?;
        Ok(loaded.into_iter()
                 .map(|r| RowRecord { row_id: r.row_id,
                                      run_id: r.run_id,
                                      source_position: r.source_position as u64,
                                      content_hash: r.content_hash })
                 .collect())
    }

    fn insert_token(&self, token: &TokenRecord, parents: &[TokenParentRecord]) -> Result<(), RecorderError> {
        let result = with_retry(|| {
            let mut conn = self.provider.connection()?;
            let outcome: Result<Result<(), RecorderError>, diesel::result::Error> =
                conn.build_transaction().read_write().run(|tx| {
                        if let Err(e) = check_parent_links(tx, token, parents) {
                            return Ok(Err(e));
                        }
                        diesel::insert_into(tokens::table).values(token_to_row(token)).execute(tx)?;
                        for link in parents {
                            diesel::insert_into(token_parents::table)
                                .values(TokenParentRow { token_id: link.token_id,
                                                         parent_token_id: link.parent_token_id,
                                                         ordinal: link.ordinal as i32 })
                                .execute(tx)?;
                        }
                        Ok(Ok(()))
                    });
            outcome.map_err(PersistenceError::from)
        });
        result.map_err(PersistenceError::into_recorder)?
    }

    fn token(&self, token_id: Uuid) -> Result<TokenRecord, RecorderError> {
        let mut conn = self.conn()?;
        let row: Option<TokenRow> = tokens::table.filter(tokens::token_id.eq(token_id))
                                                 .first(&mut conn)
                                                 .optional()
                                                 .map_err(|e| PersistenceError::from(e).into_recorder())?;
        row.map(token_from_row).ok_or(RecorderError::UnknownToken(token_id))
    }

    fn tokens_for_run(&self, run_id: Uuid) -> Result<Vec<TokenRecord>, RecorderError> {
        let mut conn = self.conn()?;
        let loaded: Vec<TokenRow> =
            tokens::table.inner_join(rows::table.on(rows::row_id.eq(tokens::row_id)))
                         .filter(rows::run_id.eq(run_id))
                         .select(tokens::all_columns)
                         .order(tokens::created_at.asc())
                         .load(&mut conn)
                         .map_err(|e| PersistenceError::from(e).into_recorder())?;
        Ok(loaded.into_iter().map(token_from_row).collect())
    }

    fn parents_of(&self, token_id: Uuid) -> Result<Vec<TokenParentRecord>, RecorderError> {
        let mut conn = self.conn()?;
        let loaded: Vec<TokenParentRow> = token_parents::table.filter(token_parents::token_id.eq(token_id))
                                                              .order(token_parents::ordinal.asc())
                                                              .load(&mut conn)
                                                              .map_err(|e| PersistenceError::from(e).into_recorder())?;
        Ok(loaded.into_iter()
                 .map(|l| TokenParentRecord { token_id: l.token_id,
                                              parent_token_id: l.parent_token_id,
                                              ordinal: l.ordinal as u32 })
                 .collect())
    }

    fn record_outcome(&self, outcome: &OutcomeRecord) -> Result<(), RecorderError> {
        self.transaction(|conn| insert_outcome(conn, outcome))
            .map_err(|e| map_outcome_insert_error(e, outcome.token_id))
    }

    fn record_branching(&self,
                        parent_outcome: &OutcomeRecord,
                        children: &[TokenRecord],
                        parent_links: &[TokenParentRecord])
                        -> Result<(), RecorderError> {
        // Hijos + links + outcome del padre en el mismo commit.
        self.transaction(|conn| {
                for child in children {
                    diesel::insert_into(tokens::table).values(token_to_row(child)).execute(conn)?;
                }
                for link in parent_links {
                    diesel::insert_into(token_parents::table)
                        .values(TokenParentRow { token_id: link.token_id,
                                                 parent_token_id: link.parent_token_id,
                                                 ordinal: link.ordinal as i32 })
                        .execute(conn)?;
                }
                insert_outcome(conn, parent_outcome)
            })
            .map_err(|e| map_outcome_insert_error(e, parent_outcome.token_id))
    }

    fn record_coalesce(&self,
                       merged: &TokenRecord,
                       merged_parents: &[TokenParentRecord],
                       input_outcomes: &[OutcomeRecord])
                       -> Result<(), RecorderError> {
        self.transaction(|conn| {
                diesel::insert_into(tokens::table).values(token_to_row(merged)).execute(conn)?;
                for link in merged_parents {
                    diesel::insert_into(token_parents::table)
                        .values(TokenParentRow { token_id: link.token_id,
                                                 parent_token_id: link.parent_token_id,
                                                 ordinal: link.ordinal as i32 })
                        .execute(conn)?;
                }
                for outcome in input_outcomes {
                    insert_outcome(conn, outcome)?;
                }
                Ok(())
            })
            .map_err(|e| map_outcome_insert_error(e, merged.token_id))
    }

    fn outcomes_for_run(&self, run_id: Uuid) -> Result<Vec<OutcomeRecord>, RecorderError> {
        let mut conn = self.conn()?;
        let loaded: Vec<OutcomeRow> = token_outcomes::table.filter(token_outcomes::run_id.eq(run_id))
                                                           .order(token_outcomes::recorded_at.asc())
                                                           .load(&mut conn)
                                                           .map_err(|e| PersistenceError::from(e).into_recorder())?;
        loaded.into_iter().map(outcome_from_row).collect()
    }

    fn outcomes_for_token(&self, token_id: Uuid) -> Result<Vec<OutcomeRecord>, RecorderError> {
        let mut conn = self.conn()?;
        let loaded: Vec<OutcomeRow> = token_outcomes::table.filter(token_outcomes::token_id.eq(token_id))
                                                           .order(token_outcomes::recorded_at.asc())
                                                           .load(&mut conn)
                                                           .map_err(|e| PersistenceError::from(e).into_recorder())?;
        loaded.into_iter().map(outcome_from_row).collect()
    }

    fn terminal_outcome(&self, token_id: Uuid) -> Result<Option<OutcomeRecord>, RecorderError> {
        let mut conn = self.conn()?;
        let row: Option<OutcomeRow> = token_outcomes::table.filter(token_outcomes::token_id.eq(token_id))
                                                           .filter(token_outcomes::is_terminal.eq(true))
                                                           .first(&mut conn)
                                                           .optional()
                                                           .map_err(|e| PersistenceError::from(e).into_recorder())?;
        row.map(outcome_from_row).transpose()
    }

    fn open_node_state(&self, state: &NodeStateRecord) -> Result<(), RecorderError> {
        self.transaction(|conn| {
                diesel::insert_into(node_states::table).values(node_state_to_row(state)).execute(conn).map(|_| ())
            })
            .map_err(PersistenceError::into_recorder)
    }

    fn close_node_state(&self, state_id: Uuid, close: &NodeStateClose) -> Result<(), RecorderError> {
        // Transición única pending → terminal en un solo UPDATE; cero filas
        // afectadas = el estado ya era terminal.
        let updated = self.transaction(|conn| {
                              diesel::update(node_states::table.filter(node_states::state_id.eq(state_id))
                                                               .filter(node_states::status.eq("pending")))
                                  .set((node_states::status.eq(close.status.as_str()),
                                        node_states::output_hash.eq(close.output_hash.clone()),
                                        node_states::completed_at.eq(Some(close.completed_at)),
                                        node_states::duration_ms.eq(Some(close.duration_ms)),
                                        node_states::error_json.eq(close.error_json.clone()),
                                        node_states::success_reason_json.eq(close.success_reason_json.clone()),
                                        node_states::context_after_json.eq(close.context_after_json.clone())))
                                  .execute(conn)
                          })
                          .map_err(PersistenceError::into_recorder)?;
        if updated == 0 {
            return Err(RecorderError::NodeStateAlreadyClosed(state_id));
        }
        Ok(())
    }

    fn node_states_for_token(&self, token_id: Uuid) -> Result<Vec<NodeStateRecord>, RecorderError> {
        let mut conn = self.conn()?;
        let loaded: Vec<NodeStateRow> = node_states::table.filter(node_states::token_id.eq(token_id))
                                                          .order((node_states::started_at.asc(),
                                                                  node_states::attempt.asc()))
                                                          .load(&mut conn)
                                                          .map_err(|e| PersistenceError::from(e).into_recorder())?;
        loaded.into_iter().map(node_state_from_row).collect()
    }

    fn record_routing(&self, events: &[RoutingEventRecord]) -> Result<(), RecorderError> {
        self.transaction(|conn| {
                for event in events {
                    diesel::insert_into(routing_events::table)
                        .values(RoutingEventRow { event_id: event.event_id,
                                                  routing_group_id: event.routing_group_id,
                                                  state_id: event.state_id,
                                                  edge_id: event.edge_id.clone(),
                                                  mode: event.mode.as_str().to_string(),
                                                  reason_json: event.reason_json.clone() })
                        .execute(conn)?;
                }
                Ok(())
            })
            .map_err(PersistenceError::into_recorder)
    }

    fn routing_for_state(&self, state_id: Uuid) -> Result<Vec<RoutingEventRecord>, RecorderError> {
        let mut conn = self.conn()?;
        let loaded: Vec<RoutingEventRow> = routing_events::table.filter(routing_events::state_id.eq(state_id))
                                                                .load(&mut conn)
                                                                .map_err(|e| {
                                                                    PersistenceError::from(e).into_recorder()
                                                                })?;
        loaded.into_iter()
              .map(|r| {
                  Ok(RoutingEventRecord { event_id: r.event_id,
                                          routing_group_id: r.routing_group_id,
                                          state_id: r.state_id,
                                          edge_id: r.edge_id,
                                          mode: parse_routing_mode(&r.mode)?,
                                          reason_json: r.reason_json })
              })
              .collect()
    }

    fn create_batch(&self, batch: &BatchRecord) -> Result<(), RecorderError> {
        self.transaction(|conn| {
                diesel::insert_into(batches::table).values(BatchRow { batch_id: batch.batch_id,
                                                                      run_id: batch.run_id,
                                                                      node_id: batch.node_id.clone(),
                                                                      status: batch.status.clone(),
                                                                      created_at: batch.created_at,
                                                                      flushed_at: batch.flushed_at })
                                                   .execute(conn)
                                                   .map(|_| ())
            })
            .map_err(PersistenceError::into_recorder)
    }

    fn add_batch_member(&self, member: &BatchMemberRecord) -> Result<(), RecorderError> {
        self.transaction(|conn| {
                diesel::insert_into(batch_members::table).values(BatchMemberRow { batch_id: member.batch_id,
                                                                                  token_id: member.token_id,
                                                                                  ordinal: member.ordinal as i32 })
                                                         .execute(conn)
                                                         .map(|_| ())
            })
            .map_err(PersistenceError::into_recorder)
    }

    fn close_batch(&self, batch_id: Uuid, flushed_at: DateTime<Utc>) -> Result<(), RecorderError> {
        let updated = self.transaction(|conn| {
                              diesel::update(batches::table.filter(batches::batch_id.eq(batch_id)))
                                  .set((batches::status.eq("flushed"), batches::flushed_at.eq(Some(flushed_at))))
                                  .execute(conn)
                          })
                          .map_err(PersistenceError::into_recorder)?;
        if updated == 0 {
            return Err(RecorderError::Storage(format!("unknown batch {batch_id}")));
        }
        Ok(())
    }

    fn batch_members(&self, batch_id: Uuid) -> Result<Vec<BatchMemberRecord>, RecorderError> {
        let mut conn = self.conn()?;
        let loaded: Vec<BatchMemberRow> = batch_members::table.filter(batch_members::batch_id.eq(batch_id))
                                                              .order(batch_members::ordinal.asc())
                                                              .load(&mut conn)
                                                              .map_err(|e| PersistenceError::from(e).into_recorder())?;
        Ok(loaded.into_iter()
                 .map(|m| BatchMemberRecord { batch_id: m.batch_id,
                                              token_id: m.token_id,
                                              ordinal: m.ordinal as u32 })
                 .collect())
    }

    fn record_assignment(&self, assignment: &ExperimentAssignmentRecord) -> Result<(), RecorderError> {
        self.transaction(|conn| {
                diesel::insert_into(experiment_assignments::table)
                    .values(AssignmentRow { run_id: assignment.run_id,
                                            row_id: assignment.row_id.clone(),
                                            experiment_id: assignment.experiment_id.clone(),
                                            variant_id: assignment.variant_id.clone(),
                                            overrides_json: assignment.overrides_json.clone(),
                                            assigned_at: assignment.assigned_at })
                    .execute(conn)
                    .map(|_| ())
            })
            .map_err(PersistenceError::into_recorder)
    }

    fn assignments_for_row(&self, run_id: Uuid, row_id: &str) -> Result<Vec<ExperimentAssignmentRecord>, RecorderError> {
        let mut conn = self.conn()?;
        let loaded: Vec<AssignmentRow> =
            experiment_assignments::table.filter(experiment_assignments::run_id.eq(run_id))
                                         .filter(experiment_assignments::row_id.eq(row_id))
                                         .order(experiment_assignments::assigned_at.asc())
                                         .load(&mut conn)
                                         .map_err(|e| PersistenceError::from(e).into_recorder())?;
        Ok(loaded.into_iter()
                 .map(|a| ExperimentAssignmentRecord { run_id: a.run_id,
                                                       row_id: a.row_id,
                                                       experiment_id: a.experiment_id,
                                                       variant_id: a.variant_id,
                                                       overrides_json: a.overrides_json,
                                                       assigned_at: a.assigned_at })
                 .collect())
    }

    fn record_call(&self, call: &CallRecord) -> Result<(), RecorderError> {
        self.transaction(|conn| {
                diesel::insert_into(calls::table).values(CallRow { call_id: call.call_id,
                                                                   run_id: call.run_id,
                                                                   token_id: call.token_id,
                                                                   node_id: call.node_id.clone(),
                                                                   service: call.service.clone(),
                                                                   request_hash: call.request_hash.clone(),
                                                                   response_hash: call.response_hash.clone(),
                                                                   status: call.status.clone(),
                                                                   recorded_at: call.recorded_at })
                                                 .execute(conn)
                                                 .map(|_| ())
            })
            .map_err(PersistenceError::into_recorder)
    }
}

/// Construye un pool Postgres r2d2 y corre las migraciones pendientes en el
/// primer checkout.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = if min_size == 0 { 1 } else { min_size };
    let validated_max = if max_size == 0 { 1 } else { max_size };
    let final_min = validated_min.min(validated_max);
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(final_min))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Helper de desarrollo: carga `.env`, lee `DATABASE_URL` y construye un
/// pool ya migrado. `None` si no hay URL configurada.
pub fn build_dev_pool_from_env() -> Result<Option<PgPool>, PersistenceError> {
    let cfg = match crate::config::DbConfig::from_env() {
        Some(cfg) => cfg,
        None => return Ok(None),
    };
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections).map(Some)
}
