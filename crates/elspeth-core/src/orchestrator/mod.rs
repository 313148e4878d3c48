//! Orquestador (C7): corre un pipeline de punta a punta.
//!
//! Modelo de ejecución: pool fijo de workers sobre una cola de trabajo
//! acotada (crossbeam). El coordinador (hilo principal) bombea la fuente,
//! despacha `WorkItem`s, recibe `StepOutcome`s y es el único dueño del
//! estado compartido de barreras de coalesce y buffers de aggregation. La
//! fuente se frena por el bloqueo natural del send en la cola llena
//! (backpressure hasta el high-water mark configurado).
//!
//! Garantías de orden: por token, los attempts de node_state quedan
//! estrictamente ordenados y hay un solo outcome terminal. Entre tokens no
//! hay orden garantizado: dos filas pueden completar en cualquier orden.
//!
//! Cancelación: el flag del run se consulta antes de cada invocación de
//! plugin, durante los backoffs y en cada espera de cola. Al cancelar se
//! deja de aceptar filas nuevas y se drena hasta el deadline; los tokens no
//! finalizados quedan visibles para el recovery manager.

pub mod aggregate;
pub mod coalesce;

pub use aggregate::{AggregationTracker, PendingFlush};
pub use coalesce::{BarrierAction, CoalesceTracker};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::ExecutionSettings;
use crate::errors::EngineError;
use crate::graph::{BuiltPipeline, ExecutionGraph, NodeExecutor};
use crate::hashing;
use crate::landscape::{Landscape, PayloadStore, RowRecord, RunRecord, RunStatus, TokenOutcomeKind};
use crate::plugin::{ErrorDisposition, PluginContext, SourcePlugin, SourcePoll, TransformErrorReason};
use crate::processor::{Arrival, RetryPolicy, RowProcessor, StepOutcome, WorkItem};
use crate::ratelimit::RateLimitRegistry;
use crate::schema::validate_row;
use crate::telemetry::TelemetryEmitter;
use crate::token::TokenManager;

/// Flag de cancelación con alcance de run. Se comparte por clonación.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Conteo de outcomes observados durante el run.
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub rows_read: u64,
    pub completed: u64,
    pub routed: u64,
    pub forked: u64,
    pub expanded: u64,
    pub coalesced: u64,
    pub consumed_in_batch: u64,
    pub quarantined: u64,
    pub failed: u64,
    pub aborted: bool,
}

impl RunReport {
    /// `true` si alguna fila terminó en cuarentena o fallo (exit code 3).
    pub fn is_partial(&self) -> bool {
        self.quarantined > 0 || self.failed > 0
    }
}

/// Orquestador de un run. Posee la fuente, el procesador y los trackers; el
/// landscape y los ejecutores se comparten con los workers.
pub struct Orchestrator {
    graph: Arc<ExecutionGraph>,
    executors: Arc<HashMap<String, NodeExecutor>>,
    source: Box<dyn SourcePlugin>,
    source_node_id: String,
    landscape: Arc<dyn Landscape>,
    payloads: Arc<dyn PayloadStore>,
    rate_limits: Arc<RateLimitRegistry>,
    telemetry: Option<TelemetryEmitter>,
    settings: ExecutionSettings,
    cancel: CancelFlag,
    config_fingerprint: String,
    /// Resume: sólo las filas con estos `row_id` (derivación determinista
    /// posición + hash) entran al run; el resto se saltea sin crear tokens.
    resume_filter: Option<std::collections::HashSet<String>>,
}

/// Resultado enviado por un worker al coordinador.
type WorkerResult = (Uuid, Result<StepOutcome, EngineError>);

impl Orchestrator {
    pub fn new(pipeline: BuiltPipeline,
               landscape: Arc<dyn Landscape>,
               payloads: Arc<dyn PayloadStore>,
               settings: ExecutionSettings,
               config_fingerprint: String)
               -> Self {
        Self { graph: Arc::new(pipeline.graph),
               executors: Arc::new(pipeline.executors),
               source: pipeline.source,
               source_node_id: pipeline.source_node_id,
               landscape,
               payloads,
               rate_limits: Arc::new(RateLimitRegistry::new()),
               telemetry: None,
               settings,
               cancel: CancelFlag::new(),
               config_fingerprint,
               resume_filter: None }
    }

    /// Configura un resume: el run procesa sólo las filas del plan de
    /// recovery, reutilizando los `row_id` originales.
    pub fn with_resume_filter(mut self, filter: std::collections::HashSet<String>) -> Self {
        self.resume_filter = Some(filter);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryEmitter) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_rate_limits(mut self, rate_limits: Arc<RateLimitRegistry>) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    /// Flag de cancelación para señalizar desde fuera (Ctrl-C, etc.).
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Corre el pipeline completo. Errores de fila quedan en el reporte;
    /// `Err` sólo para fallos fatales del motor (el run queda Aborted).
    pub fn run(mut self) -> Result<RunReport, EngineError> {
        let run_id = Uuid::new_v4();
        let run = RunRecord { run_id,
                              started_at: Utc::now(),
                              finished_at: None,
                              status: RunStatus::Running,
                              config_fingerprint: self.config_fingerprint.clone() };
        self.landscape.create_run(&run)?;
        log::info!("run {run_id} started");

        let result = self.run_inner(run_id);

        let status = match &result {
            Ok(report) if !report.aborted => RunStatus::Finished,
            _ => RunStatus::Aborted,
        };
        if let Err(e) = self.landscape.finish_run(run_id, status, Utc::now()) {
            log::error!("failed to finish run {run_id}: {e}");
        }
        self.close_sinks();
        log::info!("run {run_id} {}", status.as_str());
        result
    }

    fn run_inner(&mut self, run_id: Uuid) -> Result<RunReport, EngineError> {
        let manager = TokenManager::new(Arc::clone(&self.landscape));
        let processor = Arc::new(RowProcessor { graph: Arc::clone(&self.graph),
                                                executors: Arc::clone(&self.executors),
                                                landscape: Arc::clone(&self.landscape),
                                                payloads: Arc::clone(&self.payloads),
                                                rate_limits: Arc::clone(&self.rate_limits),
                                                telemetry: self.telemetry.clone(),
                                                manager: manager.clone(),
                                                retry: RetryPolicy::from(&self.settings.retry),
                                                run_id,
                                                cancel: self.cancel.clone() });

        let policies = self.executors
                           .iter()
                           .filter_map(|(id, ex)| match ex {
                               NodeExecutor::Coalesce { policy } => Some((id.clone(), policy.clone())),
                               _ => None,
                           })
                           .collect();
        let triggers = self.executors
                           .iter()
                           .filter_map(|(id, ex)| match ex {
                               NodeExecutor::Aggregation { trigger, .. } => Some((id.clone(), trigger.clone())),
                               _ => None,
                           })
                           .collect();
        let mut barriers = CoalesceTracker::new(policies);
        let mut batches = AggregationTracker::new(triggers);
        let mut report = RunReport { run_id, ..Default::default() };

        // Cola de trabajo acotada (backpressure) y canal de resultados sin
        // límite: los workers nunca se bloquean publicando, así el send
        // bloqueante del coordinador sobre la cola llena no puede
        // interbloquear.
        let (work_tx, work_rx) = bounded::<WorkItem>(self.settings.queue_depth);
        let (result_tx, result_rx) = unbounded::<WorkerResult>();

        let workers = self.settings.workers.max(1);
        let mut fatal: Option<EngineError> = None;

        std::thread::scope(|scope| {
            for n in 0..workers {
                let work_rx: Receiver<WorkItem> = work_rx.clone();
                let result_tx: Sender<WorkerResult> = result_tx.clone();
                let processor = Arc::clone(&processor);
                scope.spawn(move || {
                    for item in work_rx.iter() {
                        let token_id = item.token.token_id;
                        let outcome = processor.process(item);
                        if result_tx.send((token_id, outcome)).is_err() {
                            break;
                        }
                    }
                    log::debug!("worker {n} drained");
                });
            }
            drop(result_tx);

            let mut in_flight: u64 = 0;

            // --- bombeo de la fuente ---
            let pump_result = self.pump_source(run_id, &manager, &work_tx, &result_rx, &mut in_flight, &mut barriers,
                                               &mut batches, &mut report, &processor, &mut fatal);
            if let Err(e) = pump_result {
                fatal.get_or_insert(e);
                self.cancel.cancel();
            }

            // --- drenaje ---
            let deadline = Instant::now() + Duration::from_millis(self.settings.drain_timeout_ms);
            loop {
                if fatal.is_some() {
                    break;
                }
                // Fuente agotada: los batches parciales y las barreras sin
                // llegadas pendientes se cierran para no colgar el run.
                if in_flight == 0 {
                    let mut produced = false;
                    for flush in batches.drain() {
                        produced |= self.handle_flush(flush, &processor, &work_tx, &mut in_flight, &mut report,
                                                      &mut fatal);
                    }
                    for action in barriers.drain() {
                        produced |= self.handle_barrier_action(action, &processor, &work_tx, &mut in_flight,
                                                               &mut report, &mut fatal);
                    }
                    if !produced {
                        break;
                    }
                }
                match result_rx.recv_timeout(Duration::from_millis(25)) {
                    Ok(result) => {
                        in_flight -= 1;
                        self.handle_result(result, &processor, &work_tx, &mut in_flight, &mut barriers, &mut batches,
                                           &mut report, &mut fatal);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                for action in barriers.tick() {
                    self.handle_barrier_action(action, &processor, &work_tx, &mut in_flight, &mut report, &mut fatal);
                }
                for flush in batches.tick() {
                    self.handle_flush(flush, &processor, &work_tx, &mut in_flight, &mut report, &mut fatal);
                }
                if self.cancel.is_canceled() && Instant::now() >= deadline {
                    // Deadline de drenaje vencido: lo no finalizado queda
                    // para recovery.
                    report.aborted = true;
                    break;
                }
            }

            drop(work_tx);
            // Drenar resultados rezagados para no perder conteos.
            while let Ok(result) = result_rx.recv_timeout(Duration::from_millis(50)) {
                in_flight = in_flight.saturating_sub(1);
                self.count_result_only(result, &mut report, &mut fatal);
            }
        });

        if let Some(e) = fatal {
            report.aborted = true;
            log::error!("run {run_id} aborted: {e}");
            return Err(e);
        }
        if self.cancel.is_canceled() {
            report.aborted = true;
        }
        Ok(report)
    }

    /// Itera la fuente creando fila + token inicial por emisión y
    /// despachando el primer paso. El send bloqueante sobre la cola acotada
    /// implementa el backpressure de la fuente.
    #[allow(clippy::too_many_arguments)]
    fn pump_source(&mut self,
                   run_id: Uuid,
                   manager: &TokenManager,
                   work_tx: &Sender<WorkItem>,
                   result_rx: &Receiver<WorkerResult>,
                   in_flight: &mut u64,
                   barriers: &mut CoalesceTracker,
                   batches: &mut AggregationTracker,
                   report: &mut RunReport,
                   processor: &Arc<RowProcessor>,
                   fatal: &mut Option<EngineError>)
                   -> Result<(), EngineError> {
        let source_schema = self.source.output_schema().clone();
        let on_validation_failure = self.source.on_validation_failure().clone();
        let source_node = self.source_node_id.clone();
        let first_edge = self.graph
                             .continue_edge(&source_node)
                             .map(|e| e.to.clone())
                             .ok_or_else(|| EngineError::Internal("source has no continue edge".to_string()))?;

        let mut position: u64 = 0;
        loop {
            if self.cancel.is_canceled() || fatal.is_some() {
                return Ok(());
            }
            let ctx = PluginContext { run_id,
                                      row_id: String::new(),
                                      token_id: Uuid::nil(),
                                      node_id: source_node.clone(),
                                      effective_options: Value::Null,
                                      landscape: Arc::clone(&self.landscape),
                                      payloads: Arc::clone(&self.payloads),
                                      rate_limits: Arc::clone(&self.rate_limits),
                                      telemetry: self.telemetry.clone() };
            let row = match self.source.next_row(&ctx) {
                Ok(SourcePoll::Row(row)) => row,
                Ok(SourcePoll::Exhausted) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    log::warn!("retryable source error: {e}");
                    std::thread::sleep(Duration::from_millis(self.settings.retry.backoff_ms));
                    continue;
                }
                Err(e) => return Err(EngineError::Internal(format!("source failed: {e}"))),
            };

            let content_hash = hashing::content_hash(&row);
            let row_id = format!("{position:06}-{}", &content_hash[..12]);
            if let Some(filter) = &self.resume_filter {
                if !filter.contains(&row_id) {
                    position += 1;
                    continue;
                }
            }
            self.landscape.record_row(&RowRecord { row_id: row_id.clone(),
                                                   run_id,
                                                   source_position: position,
                                                   content_hash })?;
            position += 1;
            report.rows_read += 1;
            let token = manager.create_initial(&row_id)?;

            // Validación contra el esquema declarado de la fuente; el fallo
            // rutea según on_validation_failure, nunca se pierde en silencio.
            let item = match validate_row(&source_schema, &row) {
                Ok(()) => WorkItem { token,
                                     node_id: first_edge.clone(),
                                     row,
                                     arrival: Arrival::Sequential },
                Err(field_errors) => {
                    let reason = TransformErrorReason::schema_validation(field_errors);
                    match &on_validation_failure {
                        ErrorDisposition::Sink(sink) if self.graph.divert_edge_to(&source_node, sink).is_some() => {
                            WorkItem { token,
                                       node_id: sink.clone(),
                                       row,
                                       arrival: Arrival::Diverted }
                        }
                        _ => {
                            let error_hash = hashing::error_hash(&serde_json::to_value(&reason).unwrap_or(Value::Null));
                            manager.quarantined(run_id, token.token_id, &error_hash)?;
                            report.quarantined += 1;
                            continue;
                        }
                    }
                }
            };

            work_tx.send(item)
                   .map_err(|_| EngineError::Internal("work queue closed".to_string()))?;
            *in_flight += 1;

            // Sin bloquear: absorber resultados disponibles para que los
            // sucesores se encolen mientras la fuente sigue.
            while let Ok(result) = result_rx.try_recv() {
                *in_flight -= 1;
                self.handle_result(result, processor, work_tx, in_flight, barriers, batches, report, fatal);
            }
            for action in barriers.tick() {
                self.handle_barrier_action(action, processor, work_tx, in_flight, report, fatal);
            }
            for flush in batches.tick() {
                self.handle_flush(flush, processor, work_tx, in_flight, report, fatal);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_result(&self,
                     (token_id, result): WorkerResult,
                     processor: &Arc<RowProcessor>,
                     work_tx: &Sender<WorkItem>,
                     in_flight: &mut u64,
                     barriers: &mut CoalesceTracker,
                     batches: &mut AggregationTracker,
                     report: &mut RunReport,
                     fatal: &mut Option<EngineError>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.note_step_error(token_id, e, fatal);
                return;
            }
        };
        match outcome {
            StepOutcome::Continue { next } => self.enqueue(work_tx, next, in_flight, fatal),
            StepOutcome::Forked { children, .. } => {
                report.forked += 1;
                for child in children {
                    self.enqueue(work_tx, child, in_flight, fatal);
                }
            }
            StepOutcome::Expanded { children, .. } => {
                report.expanded += 1;
                for child in children {
                    self.enqueue(work_tx, child, in_flight, fatal);
                }
            }
            StepOutcome::Completed { .. } => report.completed += 1,
            StepOutcome::Routed { .. } => report.routed += 1,
            StepOutcome::Quarantined => report.quarantined += 1,
            StepOutcome::Failed => report.failed += 1,
            StepOutcome::Buffered { item } => {
                let run_id = processor.run_id;
                let token = item.token.clone();
                let node_id = item.node_id.clone();
                let (batch_id, ordinal, flush) = batches.buffer(item);
                if let Err(e) = self.record_buffered(run_id, &node_id, &token, batch_id, ordinal, processor) {
                    self.note_step_error(token.token_id, e, fatal);
                    return;
                }
                if let Some(flush) = flush {
                    self.handle_flush(flush, processor, work_tx, in_flight, report, fatal);
                }
            }
            StepOutcome::ArrivedAtCoalesce { item } => {
                let action = barriers.arrive(item);
                self.handle_barrier_action(action, processor, work_tx, in_flight, report, fatal);
            }
        }
    }

    /// Registro de un token buffereado: batch (primera vez), membresía y
    /// outcome BUFFERED no terminal.
    fn record_buffered(&self,
                       run_id: Uuid,
                       node_id: &str,
                       token: &crate::landscape::TokenRecord,
                       batch_id: Uuid,
                       ordinal: u32,
                       processor: &Arc<RowProcessor>)
                       -> Result<(), EngineError> {
        if ordinal == 0 {
            self.landscape.create_batch(&crate::landscape::BatchRecord { batch_id,
                                                                         run_id,
                                                                         node_id: node_id.to_string(),
                                                                         status: "open".to_string(),
                                                                         created_at: Utc::now(),
                                                                         flushed_at: None })?;
        }
        self.landscape.add_batch_member(&crate::landscape::BatchMemberRecord { batch_id,
                                                                               token_id: token.token_id,
                                                                               ordinal })?;
        processor.manager.buffer(run_id, token.token_id, batch_id)?;
        Ok(())
    }

    fn handle_flush(&self,
                    flush: PendingFlush,
                    processor: &Arc<RowProcessor>,
                    work_tx: &Sender<WorkItem>,
                    in_flight: &mut u64,
                    report: &mut RunReport,
                    fatal: &mut Option<EngineError>)
                    -> bool {
        report.consumed_in_batch += flush.members.len() as u64;
        let batch_id = flush.batch_id;
        match processor.flush_aggregation(&flush.node_id, batch_id, &flush.members) {
            Ok(Some(next)) => {
                if let Err(e) = self.landscape.close_batch(batch_id, Utc::now()) {
                    log::error!("failed to close batch {batch_id}: {e}");
                }
                self.enqueue(work_tx, next, in_flight, fatal);
                true
            }
            Ok(None) => {
                report.failed += 1;
                let _ = self.landscape.close_batch(batch_id, Utc::now());
                false
            }
            Err(e) => {
                self.note_step_error(Uuid::nil(), e, fatal);
                false
            }
        }
    }

    fn handle_barrier_action(&self,
                             action: BarrierAction,
                             processor: &Arc<RowProcessor>,
                             work_tx: &Sender<WorkItem>,
                             in_flight: &mut u64,
                             report: &mut RunReport,
                             fatal: &mut Option<EngineError>)
                             -> bool {
        match action {
            BarrierAction::Wait => false,
            BarrierAction::Merge { node_id, inputs, merged_row } => {
                let tokens: Vec<crate::landscape::TokenRecord> = inputs.iter().map(|a| a.token.clone()).collect();
                report.coalesced += tokens.len() as u64;
                match processor.merge_coalesce(&node_id, &tokens, merged_row) {
                    Ok(next) => {
                        self.enqueue(work_tx, next, in_flight, fatal);
                        true
                    }
                    Err(e) => {
                        self.note_step_error(tokens.first().map(|t| t.token_id).unwrap_or_default(), e, fatal);
                        false
                    }
                }
            }
            BarrierAction::TimedOut { node_id, inputs } => {
                // require_all con branches faltantes al deadline produce un
                // fallo explícito, no un hang.
                let error_hash = hashing::error_hash(&json!({"error": "coalesce timed out", "node": node_id}));
                for arrival in inputs {
                    match processor.manager.failed(processor.run_id, arrival.token.token_id, &error_hash) {
                        Ok(()) => report.failed += 1,
                        Err(e) => self.note_step_error(arrival.token.token_id, e.into(), fatal),
                    }
                }
                false
            }
            BarrierAction::Late { item, join_group_id } => {
                // Llegada tardía a una barrera cerrada (quorum): COALESCED
                // en el mismo join group, sin parentesco en el fusionado.
                let mut outcome = crate::landscape::OutcomeRecord::terminal(processor.run_id, item.token.token_id,
                                                                            TokenOutcomeKind::Coalesced);
                outcome.join_group_id = Some(join_group_id);
                match self.landscape.record_outcome(&outcome) {
                    Ok(()) => report.coalesced += 1,
                    Err(e) => self.note_step_error(item.token.token_id, e.into(), fatal),
                }
                false
            }
        }
    }

    fn enqueue(&self, work_tx: &Sender<WorkItem>, item: WorkItem, in_flight: &mut u64, fatal: &mut Option<EngineError>) {
        let token_id = item.token.token_id;
        match work_tx.send(item) {
            Ok(()) => *in_flight += 1,
            Err(_) => self.note_step_error(token_id, EngineError::Internal("work queue closed".to_string()), fatal),
        }
    }

    /// Política de errores de paso:
    /// - RecorderError: fatal al token (no se puede garantizar el outcome
    ///   único sin registro); se loguea con severidad y el token queda sin
    ///   finalizar, visible para recovery.
    /// - Cancelación: el token queda sin finalizar, visible para recovery.
    /// - Resto (bugs del core): tumban el run con diagnóstico.
    fn note_step_error(&self, token_id: Uuid, error: EngineError, fatal: &mut Option<EngineError>) {
        match error {
            EngineError::Recorder(e) => {
                log::error!("recorder failure for token {token_id}: {e}; token left unfinalised");
            }
            EngineError::Canceled(_) => {
                log::warn!("token {token_id} canceled before completion");
            }
            other => {
                log::error!("fatal engine error for token {token_id}: {other}");
                self.cancel.cancel();
                fatal.get_or_insert(other);
            }
        }
    }

    fn count_result_only(&self, (token_id, result): WorkerResult, report: &mut RunReport, fatal: &mut Option<EngineError>) {
        match result {
            Ok(StepOutcome::Completed { .. }) => report.completed += 1,
            Ok(StepOutcome::Routed { .. }) => report.routed += 1,
            Ok(StepOutcome::Quarantined) => report.quarantined += 1,
            Ok(StepOutcome::Failed) => report.failed += 1,
            Ok(_) => {}
            Err(e) => self.note_step_error(token_id, e, fatal),
        }
    }

    fn close_sinks(&self) {
        for (node_id, executor) in self.executors.iter() {
            if let NodeExecutor::Sink { plugin, .. } = executor {
                let mut plugin = plugin.lock().unwrap_or_else(|p| p.into_inner());
                if let Err(e) = plugin.flush() {
                    log::error!("sink '{node_id}' flush failed: {e}");
                }
                if let Err(e) = plugin.close() {
                    log::error!("sink '{node_id}' close failed: {e}");
                }
            }
        }
    }
}
