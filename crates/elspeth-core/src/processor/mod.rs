//! Procesador de filas (C6): lleva un token a través de UN nodo.
//!
//! Secuencia por (token, nodo):
//! 1. Guard de outcome: un token ya terminal entregado aquí es un bug del
//!    scheduler; se falla duro, sin degradar.
//! 2. Validación del esquema de entrada (se omite si es dinámico).
//! 3. Apertura de node_state (pending, input_hash). Los retries abren
//!    attempts nuevos.
//! 4. Invocación del plugin con política de reintentos: kinds transitorios
//!    (RateLimit, Network, Server, Timeout) se reintentan dentro del
//!    presupuesto; el resto aflora de inmediato como error tipado.
//! 5. Clasificación del resultado en un `StepOutcome` que el orquestador
//!    traduce a trabajo nuevo o disposición terminal.
//!
//! Convenciones de disposición:
//! - Error de plugin (terminal o presupuesto agotado) → outcome FAILED con
//!   `error_hash`.
//! - Error de datos (validación de esquema, colisión de campos) con
//!   `on_error = discard` → outcome QUARANTINED.
//! - `on_error = <sink>` desvía por el edge DIVERT; el outcome lo registra
//!   el sink como ROUTED.

pub mod retry;

pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::graph::{ExecutionGraph, GraphEdge, NodeExecutor, NodeKind};
use crate::hashing;
use crate::landscape::{Landscape, NodeStateClose, NodeStateRecord, NodeStateStatus, PayloadStore, RoutingEventRecord,
                       TokenRecord};
use crate::orchestrator::CancelFlag;
use crate::plugin::{ErrorDisposition, ErrorType, GateDecision, PluginContext, SuccessReason, TransformErrorReason,
                    TransformResult};
use crate::ratelimit::RateLimitRegistry;
use crate::schema::{validate_row, Schema};
use crate::telemetry::TelemetryEmitter;
use crate::token::TokenManager;

/// Cómo llegó el token al nodo actual. Decide el outcome al alcanzar un
/// sink: secuencial → COMPLETED; vía gate o DIVERT → ROUTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    Sequential,
    Routed,
    Diverted,
}

/// Unidad de trabajo: este token, en este nodo, con esta fila en memoria.
/// El core no persiste datos de fila; sólo hashes.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub token: TokenRecord,
    pub node_id: String,
    pub row: Value,
    pub arrival: Arrival,
}

/// Resultado de procesar un paso, consumido por el orquestador.
#[derive(Debug)]
pub enum StepOutcome {
    /// El token sigue por un edge MOVE.
    Continue { next: WorkItem },
    /// Fork: padre terminal FORKED, hijos listos para encolar.
    Forked { children: Vec<WorkItem>, fork_group_id: Uuid },
    /// Expand: un hijo por fila producida.
    Expanded { children: Vec<WorkItem>, expand_group_id: Uuid },
    /// El token alcanzó un sink y quedó COMPLETED.
    Completed { sink: String },
    /// El token alcanzó un sink vía gate/DIVERT y quedó ROUTED.
    Routed { sink: String },
    /// Error de datos descartado: QUARANTINED.
    Quarantined,
    /// Error de plugin terminal: FAILED.
    Failed,
    /// El token llegó a una aggregation; el orquestador lo suma al batch.
    Buffered { item: WorkItem },
    /// El token llegó a una barrera de coalesce.
    ArrivedAtCoalesce { item: WorkItem },
}

pub struct RowProcessor {
    pub graph: Arc<ExecutionGraph>,
    pub executors: Arc<HashMap<String, NodeExecutor>>,
    pub landscape: Arc<dyn Landscape>,
    pub payloads: Arc<dyn PayloadStore>,
    pub rate_limits: Arc<RateLimitRegistry>,
    pub telemetry: Option<TelemetryEmitter>,
    pub manager: TokenManager,
    pub retry: RetryPolicy,
    pub run_id: Uuid,
    pub cancel: CancelFlag,
}

impl RowProcessor {
    /// Procesa un paso. `Err` sólo para condiciones fatales del motor
    /// (cancelación, fallo del recorder, bug de scheduling); los errores de
    /// fila se resuelven en un `StepOutcome`.
    pub fn process(&self, item: WorkItem) -> Result<StepOutcome, EngineError> {
        if self.cancel.is_canceled() {
            return Err(EngineError::Canceled(self.run_id));
        }
        // Guard: un token finalizado no puede volver a ejecutar.
        if self.landscape.terminal_outcome(item.token.token_id)?.is_some() {
            return Err(EngineError::TokenAlreadyTerminal(item.token.token_id));
        }

        let node = self.graph
                       .node(&item.node_id)
                       .ok_or_else(|| EngineError::Internal(format!("unknown node '{}'", item.node_id)))?
                       .clone();
        match node.kind {
            NodeKind::Coalesce => Ok(StepOutcome::ArrivedAtCoalesce { item }),
            NodeKind::Aggregation => self.process_aggregation_arrival(item),
            NodeKind::Transform => self.process_transform(item),
            NodeKind::Gate => self.process_gate(item),
            NodeKind::Sink => self.process_sink(item),
            NodeKind::Source => Err(EngineError::Internal("source nodes are driven by the orchestrator".to_string())),
        }
    }

    /// Contexto de invocación. Las opciones efectivas del nodo llevan los
    /// overrides de experimento de la fila ya fusionados (los hijos heredan
    /// la asignación de su fila).
    fn context(&self, item: &WorkItem) -> Result<PluginContext, EngineError> {
        let base = self.graph
                       .node(&item.node_id)
                       .map(|n| n.config.clone())
                       .unwrap_or(Value::Null);
        let effective_options = crate::experiment::effective_options(&self.landscape, self.run_id,
                                                                     &item.token.row_id, &base)?;
        Ok(PluginContext { run_id: self.run_id,
                           row_id: item.token.row_id.clone(),
                           token_id: item.token.token_id,
                           node_id: item.node_id.clone(),
                           effective_options,
                           landscape: Arc::clone(&self.landscape),
                           payloads: Arc::clone(&self.payloads),
                           rate_limits: Arc::clone(&self.rate_limits),
                           telemetry: self.telemetry.clone() })
    }

    fn executor(&self, node_id: &str) -> Result<&NodeExecutor, EngineError> {
        self.executors
            .get(node_id)
            .ok_or_else(|| EngineError::Internal(format!("no executor for node '{node_id}'")))
    }

    // --- node_state helpers ---

    fn open_state(&self, item: &WorkItem, attempt: u32, input_hash: &str) -> Result<Uuid, EngineError> {
        let state_id = Uuid::new_v4();
        let record = NodeStateRecord { state_id,
                                       token_id: item.token.token_id,
                                       node_id: item.node_id.clone(),
                                       attempt,
                                       status: NodeStateStatus::Pending,
                                       input_hash: input_hash.to_string(),
                                       output_hash: None,
                                       started_at: Utc::now(),
                                       completed_at: None,
                                       duration_ms: None,
                                       error_json: None,
                                       success_reason_json: None,
                                       context_before_json: None,
                                       context_after_json: None };
        self.landscape.open_node_state(&record)?;
        Ok(state_id)
    }

    fn close_completed(&self,
                       state_id: Uuid,
                       started: chrono::DateTime<Utc>,
                       output_hash: Option<String>,
                       reason: Option<&SuccessReason>)
                       -> Result<(), EngineError> {
        let now = Utc::now();
        let close = NodeStateClose { status: NodeStateStatus::Completed,
                                     output_hash,
                                     completed_at: now,
                                     duration_ms: (now - started).num_milliseconds(),
                                     error_json: None,
                                     success_reason_json: reason.map(|r| serde_json::to_value(r).unwrap_or(Value::Null)),
                                     context_after_json: None };
        self.landscape.close_node_state(state_id, &close)?;
        Ok(())
    }

    fn close_failed(&self,
                    state_id: Uuid,
                    started: chrono::DateTime<Utc>,
                    reason: &TransformErrorReason)
                    -> Result<(), EngineError> {
        let now = Utc::now();
        let close = NodeStateClose { status: NodeStateStatus::Failed,
                                     output_hash: None,
                                     completed_at: now,
                                     duration_ms: (now - started).num_milliseconds(),
                                     error_json: Some(serde_json::to_value(reason).unwrap_or(Value::Null)),
                                     success_reason_json: None,
                                     context_after_json: None };
        self.landscape.close_node_state(state_id, &close)?;
        Ok(())
    }

    /// Loop de reintentos: abre un node_state por attempt; los fallos
    /// retryables cierran el attempt como failed y duermen el backoff. En
    /// éxito devuelve el state_id abierto (el caller lo cierra con su
    /// output); en fallo definitivo el último attempt ya quedó failed.
    fn run_attempts<T>(&self,
                       item: &WorkItem,
                       input_hash: &str,
                       mut invoke: impl FnMut() -> Result<T, TransformErrorReason>)
                       -> Result<RunAttempts<T>, EngineError> {
        let mut attempt = 1u32;
        loop {
            if self.cancel.is_canceled() {
                return Err(EngineError::Canceled(self.run_id));
            }
            let started = Utc::now();
            let state_id = self.open_state(item, attempt, input_hash)?;
            match invoke() {
                Ok(value) => return Ok(RunAttempts::Success { state_id, started, value }),
                Err(reason) => {
                    self.close_failed(state_id, started, &reason)?;
                    if reason.is_retryable() && attempt < self.retry.max_attempts {
                        log::warn!("retryable error at node '{}' token {} (attempt {attempt}): {}",
                                   item.node_id, item.token.token_id, reason.message);
                        if !self.retry.sleep_backoff(attempt, &self.cancel) {
                            return Err(EngineError::Canceled(self.run_id));
                        }
                        attempt += 1;
                        continue;
                    }
                    return Ok(RunAttempts::Exhausted { reason });
                }
            }
        }
    }

    // --- transforms ---

    fn process_transform(&self, item: WorkItem) -> Result<StepOutcome, EngineError> {
        let (plugin, on_error) = match self.executor(&item.node_id)? {
            NodeExecutor::Transform { plugin, on_error } => (plugin, on_error.clone()),
            _ => return Err(EngineError::Internal(format!("node '{}' is not a transform", item.node_id))),
        };

        // Validación de entrada previa a cualquier mutación.
        if let Err(field_errors) = validate_row(plugin.input_schema(), &item.row) {
            let reason = TransformErrorReason::schema_validation(field_errors);
            let input_hash = hashing::content_hash(&item.row);
            let started = Utc::now();
            let state_id = self.open_state(&item, 1, &input_hash)?;
            self.close_failed(state_id, started, &reason)?;
            return self.dispose_error(&item, state_id, &reason, &on_error);
        }

        let input_hash = hashing::content_hash(&item.row);
        let ctx = self.context(&item)?;
        let row = item.row.clone();
        let outcome = self.run_attempts(&item, &input_hash, || match plugin.process(row.clone(), &ctx) {
                              TransformResult::Error(reason) => Err(reason),
                              ok => Ok(ok),
                          })?;

        let (state_id, started, result) = match outcome {
            RunAttempts::Success { state_id, started, value } => (state_id, started, value),
            RunAttempts::Exhausted { reason } => {
                // El último attempt ya quedó failed; falta la disposición.
                return self.dispose_error_without_state(&item, &reason, &on_error);
            }
        };

        match result {
            TransformResult::Success { row, reason } => {
                if let Some(collision) = self.detect_field_collision(&item.row, plugin.output_schema(),
                                                                     plugin.input_schema(), reason.as_ref())
                {
                    self.close_failed(state_id, started, &collision)?;
                    return self.dispose_error_without_state(&item, &collision, &on_error);
                }
                self.close_completed(state_id, started, Some(hashing::content_hash(&row)), reason.as_ref())?;
                let next = self.next_sequential(&item, row)?;
                Ok(StepOutcome::Continue { next })
            }
            TransformResult::SuccessMulti { rows, reason } => {
                self.close_completed(state_id, started, Some(hashing::content_hash(&json!(rows))), reason.as_ref())?;
                self.expand_children(&item, rows)
            }
            TransformResult::Error(_) => unreachable!("errors handled by run_attempts"),
        }
    }

    /// Colisión de campos: un transform que declara `fields_added` ya
    /// presentes en la fila de entrada sobreescribiría en silencio; se
    /// convierte en error, nunca en overwrite. `fields_removed` con
    /// `output_schema == input_schema` (ambos estrictos) es igual de
    /// inconsistente: el esquema dice que los campos siguen requeridos.
    fn detect_field_collision(&self,
                              input_row: &Value,
                              output_schema: &Schema,
                              input_schema: &Schema,
                              reason: Option<&SuccessReason>)
                              -> Option<TransformErrorReason> {
        let reason = reason?;
        let input_fields = input_row.as_object()?;
        let collisions: Vec<String> = reason.fields_added
                                            .iter()
                                            .filter(|f| input_fields.contains_key(*f))
                                            .cloned()
                                            .collect();
        if !collisions.is_empty() {
            return Some(TransformErrorReason::field_collision(collisions));
        }
        if !reason.fields_removed.is_empty() && !input_schema.is_dynamic() && output_schema == input_schema {
            return Some(TransformErrorReason::field_collision(reason.fields_removed.clone()));
        }
        None
    }

    fn next_sequential(&self, item: &WorkItem, row: Value) -> Result<WorkItem, EngineError> {
        let edge = self.graph
                       .continue_edge(&item.node_id)
                       .ok_or_else(|| EngineError::Internal(format!("node '{}' has no continue edge", item.node_id)))?;
        Ok(WorkItem { token: item.token.clone(),
                      node_id: edge.to.clone(),
                      row,
                      arrival: Arrival::Sequential })
    }

    fn expand_children(&self, item: &WorkItem, rows: Vec<Value>) -> Result<StepOutcome, EngineError> {
        let edge = self.graph
                       .continue_edge(&item.node_id)
                       .ok_or_else(|| EngineError::Internal(format!("node '{}' has no continue edge", item.node_id)))?;
        let (children, expand_group_id) =
            self.manager
                .expand(self.run_id, &item.token, rows.len(), item.token.step_in_pipeline + 1)?;
        let items = children.into_iter()
                            .zip(rows)
                            .map(|(token, row)| WorkItem { token,
                                                           node_id: edge.to.clone(),
                                                           row,
                                                           arrival: Arrival::Sequential })
                            .collect();
        Ok(StepOutcome::Expanded { children: items, expand_group_id })
    }

    /// Disposición de un error ya registrado en un node_state.
    fn dispose_error(&self,
                     item: &WorkItem,
                     state_id: Uuid,
                     reason: &TransformErrorReason,
                     on_error: &ErrorDisposition)
                     -> Result<StepOutcome, EngineError> {
        match on_error {
            ErrorDisposition::Sink(sink) => {
                if let Some(edge) = self.graph.divert_edge_to(&item.node_id, sink) {
                    self.record_routing_events(state_id, &[(edge, json!({"error": reason.message}))])?;
                    return Ok(StepOutcome::Continue { next: WorkItem { token: item.token.clone(),
                                                                      node_id: sink.clone(),
                                                                      row: item.row.clone(),
                                                                      arrival: Arrival::Diverted } });
                }
                // Sin edge DIVERT declarado no hay ruta auditable: cae a discard.
                log::error!("on_error sink '{sink}' has no divert edge from '{}'; discarding", item.node_id);
                self.dispose_discard(item, reason)
            }
            ErrorDisposition::Discard => self.dispose_discard(item, reason),
        }
    }

    fn dispose_error_without_state(&self,
                                   item: &WorkItem,
                                   reason: &TransformErrorReason,
                                   on_error: &ErrorDisposition)
                                   -> Result<StepOutcome, EngineError> {
        match on_error {
            ErrorDisposition::Sink(sink) if self.graph.divert_edge_to(&item.node_id, sink).is_some() => {
                Ok(StepOutcome::Continue { next: WorkItem { token: item.token.clone(),
                                                            node_id: sink.clone(),
                                                            row: item.row.clone(),
                                                            arrival: Arrival::Diverted } })
            }
            _ => self.dispose_discard(item, reason),
        }
    }

    /// Discard: errores de plugin quedan FAILED; errores de datos (esquema,
    /// colisión) quedan QUARANTINED.
    fn dispose_discard(&self, item: &WorkItem, reason: &TransformErrorReason) -> Result<StepOutcome, EngineError> {
        let error_hash = hashing::error_hash(&serde_json::to_value(reason).unwrap_or(Value::Null));
        match reason.error_type {
            ErrorType::Plugin(_) => {
                self.manager.failed(self.run_id, item.token.token_id, &error_hash)?;
                Ok(StepOutcome::Failed)
            }
            ErrorType::SchemaValidation | ErrorType::FieldCollision => {
                self.manager.quarantined(self.run_id, item.token.token_id, &error_hash)?;
                Ok(StepOutcome::Quarantined)
            }
        }
    }

    // --- gates ---

    fn process_gate(&self, item: WorkItem) -> Result<StepOutcome, EngineError> {
        let plugin = match self.executor(&item.node_id)? {
            NodeExecutor::Gate { plugin } => plugin,
            _ => return Err(EngineError::Internal(format!("node '{}' is not a gate", item.node_id))),
        };

        if let Err(field_errors) = validate_row(plugin.input_schema(), &item.row) {
            let reason = TransformErrorReason::schema_validation(field_errors);
            let input_hash = hashing::content_hash(&item.row);
            let started = Utc::now();
            let state_id = self.open_state(&item, 1, &input_hash)?;
            self.close_failed(state_id, started, &reason)?;
            return self.dispose_discard(&item, &reason);
        }

        let input_hash = hashing::content_hash(&item.row);
        let ctx = self.context(&item)?;
        let outcome = self.run_attempts(&item, &input_hash, || {
                              plugin.decide(&item.row, &ctx).map_err(|e| TransformErrorReason::plugin(&e))
                          })?;
        let (state_id, started, decision) = match outcome {
            RunAttempts::Success { state_id, started, value } => (state_id, started, value),
            RunAttempts::Exhausted { reason } => return self.dispose_discard(&item, &reason),
        };

        match decision {
            GateDecision::Route(label) => {
                let edge = self.graph
                               .edge_labelled(&item.node_id, &label)
                               .ok_or_else(|| EngineError::Internal(format!("gate '{}' routed to undeclared label \
                                                                             '{label}'",
                                                                            item.node_id)))?;
                let reason = json!({"decision": label});
                self.record_routing_events(state_id, &[(edge, reason)])?;
                self.close_completed(state_id, started, Some(input_hash.clone()),
                                     Some(&SuccessReason::action("route")))?;
                let to_node = self.graph
                                  .node(&edge.to)
                                  .ok_or_else(|| EngineError::Internal(format!("edge to unknown node '{}'", edge.to)))?;
                let arrival = if to_node.kind == NodeKind::Sink && label != crate::constants::CONTINUE_LABEL {
                    Arrival::Routed
                } else {
                    Arrival::Sequential
                };
                Ok(StepOutcome::Continue { next: WorkItem { token: item.token.clone(),
                                                            node_id: edge.to.clone(),
                                                            row: item.row.clone(),
                                                            arrival } })
            }
            GateDecision::Fork => {
                let copy_edges = self.graph.copy_edges(&item.node_id);
                if copy_edges.is_empty() {
                    return Err(EngineError::Internal(format!("gate '{}' decided Fork but has no COPY edges",
                                                             item.node_id)));
                }
                let branches: Vec<String> = copy_edges.iter().map(|e| e.label.clone()).collect();
                let (children, fork_group_id) =
                    self.manager
                        .fork(self.run_id, &item.token, &branches, item.token.step_in_pipeline + 1)?;
                let events: Vec<(&GraphEdge, Value)> = copy_edges.iter()
                                                                 .map(|e| (*e, json!({"branch": e.label})))
                                                                 .collect();
                self.record_routing_events(state_id, &events)?;
                self.close_completed(state_id, started, Some(input_hash.clone()),
                                     Some(&SuccessReason::action("fork")))?;
                let items = children.into_iter()
                                    .zip(copy_edges)
                                    .map(|(token, edge)| WorkItem { token,
                                                                    node_id: edge.to.clone(),
                                                                    row: item.row.clone(),
                                                                    arrival: Arrival::Sequential })
                                    .collect();
                Ok(StepOutcome::Forked { children: items, fork_group_id })
            }
        }
    }

    /// Un routing_event por destino elegido; todos comparten el
    /// `routing_group_id` de la decisión.
    fn record_routing_events(&self, state_id: Uuid, chosen: &[(&GraphEdge, Value)]) -> Result<(), EngineError> {
        let routing_group_id = Uuid::new_v4();
        let events: Vec<RoutingEventRecord> = chosen.iter()
                                                    .map(|(edge, reason)| RoutingEventRecord {
                                                        event_id: Uuid::new_v4(),
                                                        routing_group_id,
                                                        state_id,
                                                        edge_id: edge.id.clone(),
                                                        mode: edge.mode.routing_mode(),
                                                        reason_json: Some(reason.clone()),
                                                    })
                                                    .collect();
        self.landscape.record_routing(&events)?;
        Ok(())
    }

    // --- aggregations ---

    /// Llegada a una aggregation: se valida y se registra el node_state con
    /// acción "buffered"; el orquestador asigna el batch y registra el
    /// outcome BUFFERED.
    fn process_aggregation_arrival(&self, item: WorkItem) -> Result<StepOutcome, EngineError> {
        let plugin = match self.executor(&item.node_id)? {
            NodeExecutor::Aggregation { plugin, .. } => plugin,
            _ => return Err(EngineError::Internal(format!("node '{}' is not an aggregation", item.node_id))),
        };
        if let Err(field_errors) = validate_row(plugin.input_schema(), &item.row) {
            let reason = TransformErrorReason::schema_validation(field_errors);
            let input_hash = hashing::content_hash(&item.row);
            let started = Utc::now();
            let state_id = self.open_state(&item, 1, &input_hash)?;
            self.close_failed(state_id, started, &reason)?;
            return self.dispose_discard(&item, &reason);
        }
        let input_hash = hashing::content_hash(&item.row);
        let started = Utc::now();
        let state_id = self.open_state(&item, 1, &input_hash)?;
        self.close_completed(state_id, started, None, Some(&SuccessReason::action("buffered")))?;
        Ok(StepOutcome::Buffered { item })
    }

    /// Cierra una barrera de coalesce: crea el token fusionado (padres en
    /// orden de llegada), registra el node_state del coalesce y devuelve el
    /// trabajo siguiente por el edge de continuación.
    pub fn merge_coalesce(&self,
                          node_id: &str,
                          inputs: &[TokenRecord],
                          merged_row: Value)
                          -> Result<WorkItem, EngineError> {
        let join_group_id = Uuid::new_v4();
        let step = inputs.iter().map(|t| t.step_in_pipeline).max().unwrap_or(0) + 1;
        let merged = self.manager.coalesce(self.run_id, inputs, join_group_id, step)?;

        let merged_item = WorkItem { token: merged,
                                     node_id: node_id.to_string(),
                                     row: merged_row,
                                     arrival: Arrival::Sequential };
        let input_hash = hashing::content_hash(&merged_item.row);
        let started = Utc::now();
        let state_id = self.open_state(&merged_item, 1, &input_hash)?;
        self.close_completed(state_id, started, Some(input_hash), Some(&SuccessReason::action("coalesce")))?;

        self.next_sequential(&merged_item, merged_item.row.clone())
    }

    /// Ejecuta el flush de una aggregation: token de salida parentado a los
    /// miembros, fila resumen del batch a través del contrato de transform,
    /// y continuación por el edge del nodo. `None` si el flush terminó en
    /// error (el token de salida quedó FAILED/QUARANTINED).
    pub fn flush_aggregation(&self,
                             node_id: &str,
                             batch_id: Uuid,
                             members: &[WorkItem])
                             -> Result<Option<WorkItem>, EngineError> {
        let plugin = match self.executor(node_id)? {
            NodeExecutor::Aggregation { plugin, .. } => plugin,
            _ => return Err(EngineError::Internal(format!("node '{node_id}' is not an aggregation"))),
        };
        let member_tokens: Vec<TokenRecord> = members.iter().map(|m| m.token.clone()).collect();
        let step = member_tokens.iter().map(|t| t.step_in_pipeline).max().unwrap_or(0) + 1;
        let output_token = self.manager.flush_batch(self.run_id, &member_tokens, batch_id, step)?;

        // Fila resumen del batch: los rows miembros en orden de buffer.
        let rows: Vec<Value> = members.iter().map(|m| m.row.clone()).collect();
        let summary = json!({ "rows": rows, "count": members.len(), "batch_id": batch_id.to_string() });
        let flush_item = WorkItem { token: output_token,
                                    node_id: node_id.to_string(),
                                    row: summary.clone(),
                                    arrival: Arrival::Sequential };

        let input_hash = hashing::content_hash(&summary);
        let ctx = self.context(&flush_item)?;
        let outcome = self.run_attempts(&flush_item, &input_hash, || match plugin.process(summary.clone(), &ctx) {
                              TransformResult::Error(reason) => Err(reason),
                              ok => Ok(ok),
                          })?;
        let (state_id, started, result) = match outcome {
            RunAttempts::Success { state_id, started, value } => (state_id, started, value),
            RunAttempts::Exhausted { reason } => {
                self.dispose_discard(&flush_item, &reason)?;
                return Ok(None);
            }
        };
        match result {
            TransformResult::Success { row, reason } => {
                self.close_completed(state_id, started, Some(hashing::content_hash(&row)), reason.as_ref())?;
                Ok(Some(self.next_sequential(&flush_item, row)?))
            }
            TransformResult::SuccessMulti { .. } => {
                Err(EngineError::Internal(format!("aggregation '{node_id}' returned multiple rows on flush")))
            }
            TransformResult::Error(_) => unreachable!("errors handled by run_attempts"),
        }
    }

    // --- sinks ---

    fn process_sink(&self, item: WorkItem) -> Result<StepOutcome, EngineError> {
        let plugin_cell = match self.executor(&item.node_id)? {
            NodeExecutor::Sink { plugin, .. } => plugin,
            _ => return Err(EngineError::Internal(format!("node '{}' is not a sink", item.node_id))),
        };

        // Los payloads desviados (DIVERT) no tienen por qué cumplir el
        // esquema del sink; se omite la validación en ese caso.
        if item.arrival != Arrival::Diverted {
            let schema = { plugin_cell.lock().unwrap_or_else(|p| p.into_inner()).input_schema().clone() };
            if let Err(field_errors) = validate_row(&schema, &item.row) {
                let reason = TransformErrorReason::schema_validation(field_errors);
                let input_hash = hashing::content_hash(&item.row);
                let started = Utc::now();
                let state_id = self.open_state(&item, 1, &input_hash)?;
                self.close_failed(state_id, started, &reason)?;
                return self.dispose_discard(&item, &reason);
            }
        }

        let input_hash = hashing::content_hash(&item.row);
        let ctx = self.context(&item)?;
        let outcome = self.run_attempts(&item, &input_hash, || {
                              let mut plugin = plugin_cell.lock().unwrap_or_else(|p| p.into_inner());
                              plugin.write(&item.row, &ctx).map_err(|e| TransformErrorReason::plugin(&e))
                          })?;
        let (state_id, started, _ack) = match outcome {
            RunAttempts::Success { state_id, started, value } => (state_id, started, value),
            RunAttempts::Exhausted { reason } => return self.dispose_discard(&item, &reason),
        };
        self.close_completed(state_id, started, Some(input_hash), Some(&SuccessReason::action("write")))?;

        match item.arrival {
            Arrival::Sequential => {
                self.manager.completed(self.run_id, item.token.token_id, &item.node_id)?;
                Ok(StepOutcome::Completed { sink: item.node_id })
            }
            Arrival::Routed | Arrival::Diverted => {
                self.manager.routed(self.run_id, item.token.token_id, &item.node_id)?;
                Ok(StepOutcome::Routed { sink: item.node_id })
            }
        }
    }
}

/// Resultado interno del loop de attempts.
enum RunAttempts<T> {
    Success {
        state_id: Uuid,
        started: chrono::DateTime<Utc>,
        value: T,
    },
    /// Presupuesto agotado o error no retryable; el último attempt quedó
    /// registrado como failed.
    Exhausted { reason: TransformErrorReason },
}
