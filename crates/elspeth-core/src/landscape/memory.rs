//! Implementación en memoria del `Landscape`.
//!
//! - Volátil: referencia para tests y runs efímeros; el backend durable es
//!   `elspeth-persistence`.
//! - Thread-safe con un único `Mutex` interno: las mutaciones compuestas
//!   (fork, coalesce) son atómicas respecto a otros llamadores, igual que
//!   las transacciones del backend Postgres.
//! - Aplica los mismos invariantes que el esquema SQL: outcome terminal
//!   único, parentesco acíclico, node_states append-only.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::RecorderError;

use super::types::*;
use super::Landscape;

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, RunRecord>,
    rows: Vec<RowRecord>,
    tokens: HashMap<Uuid, TokenRecord>,
    token_parents: Vec<TokenParentRecord>,
    node_states: Vec<NodeStateRecord>,
    routing_events: Vec<RoutingEventRecord>,
    outcomes: Vec<OutcomeRecord>,
    batches: HashMap<Uuid, BatchRecord>,
    batch_members: Vec<BatchMemberRecord>,
    assignments: Vec<ExperimentAssignmentRecord>,
    calls: Vec<CallRecord>,
}

impl Inner {
    fn has_terminal(&self, token_id: Uuid) -> bool {
        self.outcomes.iter().any(|o| o.token_id == token_id && o.is_terminal)
    }

    /// `true` si `candidate` aparece en la ascendencia de `token_id`.
    fn is_ancestor(&self, candidate: Uuid, token_id: Uuid) -> bool {
        let mut frontier = vec![token_id];
        while let Some(current) = frontier.pop() {
            for link in self.token_parents.iter().filter(|l| l.token_id == current) {
                if link.parent_token_id == candidate {
                    return true;
                }
                frontier.push(link.parent_token_id);
            }
        }
        false
    }

    fn check_parent_links(&self, token: &TokenRecord, parents: &[TokenParentRecord]) -> Result<(), RecorderError> {
        for link in parents {
            let parent = self.tokens
                             .get(&link.parent_token_id)
                             .ok_or(RecorderError::UnknownToken(link.parent_token_id))?;
            if parent.created_at > token.created_at {
                return Err(RecorderError::InvalidParentLink { token: token.token_id,
                                                              reason: format!("parent {} is younger than child",
                                                                              link.parent_token_id) });
            }
            if self.is_ancestor(token.token_id, link.parent_token_id) {
                return Err(RecorderError::InvalidParentLink { token: token.token_id,
                                                              reason: "circular parentage".to_string() });
            }
        }
        Ok(())
    }

    fn insert_token_checked(&mut self, token: &TokenRecord, parents: &[TokenParentRecord]) -> Result<(), RecorderError> {
        self.check_parent_links(token, parents)?;
        self.tokens.insert(token.token_id, token.clone());
        self.token_parents.extend(parents.iter().cloned());
        Ok(())
    }

    fn record_outcome_checked(&mut self, outcome: &OutcomeRecord) -> Result<(), RecorderError> {
        if !self.tokens.contains_key(&outcome.token_id) {
            return Err(RecorderError::UnknownToken(outcome.token_id));
        }
        // Paridad con el índice único parcial de Postgres.
        if outcome.is_terminal && self.has_terminal(outcome.token_id) {
            return Err(RecorderError::DuplicateTerminal(outcome.token_id));
        }
        self.outcomes.push(outcome.clone());
        Ok(())
    }

    fn run_of_row(&self, row_id: &str) -> Option<Uuid> {
        self.rows.iter().find(|r| r.row_id == row_id).map(|r| r.run_id)
    }
}

pub struct InMemoryLandscape {
    inner: Mutex<Inner>,
}

impl InMemoryLandscape {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Un poisoned lock implica un panic previo dentro del store; no hay
        // estado recuperable mejor que el actual.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for InMemoryLandscape {
    fn default() -> Self {
        Self::new()
    }
}

impl Landscape for InMemoryLandscape {
    fn create_run(&self, run: &RunRecord) -> Result<(), RecorderError> {
        self.lock().runs.insert(run.run_id, run.clone());
        Ok(())
    }

    fn finish_run(&self, run_id: Uuid, status: RunStatus, finished_at: DateTime<Utc>) -> Result<(), RecorderError> {
        let mut inner = self.lock();
        let run = inner.runs.get_mut(&run_id).ok_or(RecorderError::UnknownRun(run_id))?;
        run.status = status;
        run.finished_at = Some(finished_at);
        Ok(())
    }

    fn run(&self, run_id: Uuid) -> Result<RunRecord, RecorderError> {
        self.lock().runs.get(&run_id).cloned().ok_or(RecorderError::UnknownRun(run_id))
    }

    fn record_row(&self, row: &RowRecord) -> Result<(), RecorderError> {
        self.lock().rows.push(row.clone());
        Ok(())
    }

    fn rows_for_run(&self, run_id: Uuid) -> Result<Vec<RowRecord>, RecorderError> {
        let inner = self.lock();
        let mut rows: Vec<RowRecord> = inner.rows.iter().filter(|r| r.run_id == run_id).cloned().collect();
        rows.sort_by_key(|r| r.source_position);
        Ok(rows)
    }

    fn insert_token(&self, token: &TokenRecord, parents: &[TokenParentRecord]) -> Result<(), RecorderError> {
        self.lock().insert_token_checked(token, parents)
    }

    fn token(&self, token_id: Uuid) -> Result<TokenRecord, RecorderError> {
        self.lock().tokens.get(&token_id).cloned().ok_or(RecorderError::UnknownToken(token_id))
    }

    fn tokens_for_run(&self, run_id: Uuid) -> Result<Vec<TokenRecord>, RecorderError> {
        let inner = self.lock();
        let mut tokens: Vec<TokenRecord> = inner.tokens
                                                .values()
                                                .filter(|t| inner.run_of_row(&t.row_id) == Some(run_id))
                                                .cloned()
                                                .collect();
        tokens.sort_by_key(|t| t.created_at);
        Ok(tokens)
    }

    fn parents_of(&self, token_id: Uuid) -> Result<Vec<TokenParentRecord>, RecorderError> {
        let inner = self.lock();
        let mut links: Vec<TokenParentRecord> = inner.token_parents
                                                     .iter()
                                                     .filter(|l| l.token_id == token_id)
                                                     .cloned()
                                                     .collect();
        links.sort_by_key(|l| l.ordinal);
        Ok(links)
    }

    fn record_outcome(&self, outcome: &OutcomeRecord) -> Result<(), RecorderError> {
        self.lock().record_outcome_checked(outcome)
    }

    fn record_branching(&self,
                        parent_outcome: &OutcomeRecord,
                        children: &[TokenRecord],
                        parent_links: &[TokenParentRecord])
                        -> Result<(), RecorderError> {
        let mut inner = self.lock();
        // Validación completa antes de mutar: simula rollback de transacción.
        if inner.has_terminal(parent_outcome.token_id) {
            return Err(RecorderError::DuplicateTerminal(parent_outcome.token_id));
        }
        for child in children {
            let links: Vec<TokenParentRecord> = parent_links.iter()
                                                            .filter(|l| l.token_id == child.token_id)
                                                            .cloned()
                                                            .collect();
            inner.check_parent_links(child, &links)?;
        }
        for child in children {
            inner.tokens.insert(child.token_id, child.clone());
        }
        inner.token_parents.extend(parent_links.iter().cloned());
        inner.record_outcome_checked(parent_outcome)
    }

    fn record_coalesce(&self,
                       merged: &TokenRecord,
                       merged_parents: &[TokenParentRecord],
                       input_outcomes: &[OutcomeRecord])
                       -> Result<(), RecorderError> {
        let mut inner = self.lock();
        for o in input_outcomes {
            if inner.has_terminal(o.token_id) {
                return Err(RecorderError::DuplicateTerminal(o.token_id));
            }
        }
        inner.insert_token_checked(merged, merged_parents)?;
        for o in input_outcomes {
            inner.record_outcome_checked(o)?;
        }
        Ok(())
    }

    fn outcomes_for_run(&self, run_id: Uuid) -> Result<Vec<OutcomeRecord>, RecorderError> {
        let inner = self.lock();
        Ok(inner.outcomes.iter().filter(|o| o.run_id == run_id).cloned().collect())
    }

    fn outcomes_for_token(&self, token_id: Uuid) -> Result<Vec<OutcomeRecord>, RecorderError> {
        let inner = self.lock();
        Ok(inner.outcomes.iter().filter(|o| o.token_id == token_id).cloned().collect())
    }

    fn terminal_outcome(&self, token_id: Uuid) -> Result<Option<OutcomeRecord>, RecorderError> {
        let inner = self.lock();
        Ok(inner.outcomes.iter().find(|o| o.token_id == token_id && o.is_terminal).cloned())
    }

    fn open_node_state(&self, state: &NodeStateRecord) -> Result<(), RecorderError> {
        let mut inner = self.lock();
        if !inner.tokens.contains_key(&state.token_id) {
            return Err(RecorderError::UnknownToken(state.token_id));
        }
        inner.node_states.push(state.clone());
        Ok(())
    }

    fn close_node_state(&self, state_id: Uuid, close: &NodeStateClose) -> Result<(), RecorderError> {
        let mut inner = self.lock();
        let state = inner.node_states
                         .iter_mut()
                         .find(|s| s.state_id == state_id)
                         .ok_or(RecorderError::UnknownNodeState(state_id))?;
        if state.status.is_terminal() {
            return Err(RecorderError::NodeStateAlreadyClosed(state_id));
        }
        state.status = close.status;
        state.output_hash = close.output_hash.clone();
        state.completed_at = Some(close.completed_at);
        state.duration_ms = Some(close.duration_ms);
        state.error_json = close.error_json.clone();
        state.success_reason_json = close.success_reason_json.clone();
        state.context_after_json = close.context_after_json.clone();
        Ok(())
    }

    fn node_states_for_token(&self, token_id: Uuid) -> Result<Vec<NodeStateRecord>, RecorderError> {
        let inner = self.lock();
        let mut states: Vec<NodeStateRecord> = inner.node_states
                                                    .iter()
                                                    .filter(|s| s.token_id == token_id)
                                                    .cloned()
                                                    .collect();
        states.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.attempt.cmp(&b.attempt)));
        Ok(states)
    }

    fn record_routing(&self, events: &[RoutingEventRecord]) -> Result<(), RecorderError> {
        self.lock().routing_events.extend(events.iter().cloned());
        Ok(())
    }

    fn routing_for_state(&self, state_id: Uuid) -> Result<Vec<RoutingEventRecord>, RecorderError> {
        let inner = self.lock();
        Ok(inner.routing_events.iter().filter(|e| e.state_id == state_id).cloned().collect())
    }

    fn create_batch(&self, batch: &BatchRecord) -> Result<(), RecorderError> {
        self.lock().batches.insert(batch.batch_id, batch.clone());
        Ok(())
    }

    fn add_batch_member(&self, member: &BatchMemberRecord) -> Result<(), RecorderError> {
        self.lock().batch_members.push(member.clone());
        Ok(())
    }

    fn close_batch(&self, batch_id: Uuid, flushed_at: DateTime<Utc>) -> Result<(), RecorderError> {
        let mut inner = self.lock();
        let batch = inner.batches
                         .get_mut(&batch_id)
                         .ok_or_else(|| RecorderError::Storage(format!("unknown batch {batch_id}")))?;
        batch.status = "flushed".to_string();
        batch.flushed_at = Some(flushed_at);
        Ok(())
    }

    fn batch_members(&self, batch_id: Uuid) -> Result<Vec<BatchMemberRecord>, RecorderError> {
        let inner = self.lock();
        let mut members: Vec<BatchMemberRecord> = inner.batch_members
                                                       .iter()
                                                       .filter(|m| m.batch_id == batch_id)
                                                       .cloned()
                                                       .collect();
        members.sort_by_key(|m| m.ordinal);
        Ok(members)
    }

    fn record_assignment(&self, assignment: &ExperimentAssignmentRecord) -> Result<(), RecorderError> {
        self.lock().assignments.push(assignment.clone());
        Ok(())
    }

    fn assignments_for_row(&self, run_id: Uuid, row_id: &str) -> Result<Vec<ExperimentAssignmentRecord>, RecorderError> {
        let inner = self.lock();
        Ok(inner.assignments
                .iter()
                .filter(|a| a.run_id == run_id && a.row_id == row_id)
                .cloned()
                .collect())
    }

    fn record_call(&self, call: &CallRecord) -> Result<(), RecorderError> {
        self.lock().calls.push(call.clone());
        Ok(())
    }
}
