//! TokenManager: creación, fork, expand, coalesce y outcomes terminales.
//!
//! Contratos atómicos:
//! - `fork`/`expand` insertan N hijos, N links de padre y el outcome terminal
//!   del padre (con su contrato de branches) en UNA operación del landscape.
//! - `coalesce` inserta el token fusionado con todos sus padres en orden y
//!   marca cada input COALESCED en la misma operación.
//! - Una violación del invariante de outcome único falla la operación entera;
//!   el landscape no queda a medias.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::errors::RecorderError;
use crate::landscape::{Landscape, OutcomeRecord, TokenOutcomeKind, TokenParentRecord, TokenRecord};

#[derive(Clone)]
pub struct TokenManager {
    landscape: Arc<dyn Landscape>,
}

impl TokenManager {
    pub fn new(landscape: Arc<dyn Landscape>) -> Self {
        Self { landscape }
    }

    /// Token inicial de una fila: sin padres, sin grupos.
    pub fn create_initial(&self, row_id: &str) -> Result<TokenRecord, RecorderError> {
        let token = TokenRecord { token_id: Uuid::new_v4(),
                                  row_id: row_id.to_string(),
                                  fork_group_id: None,
                                  join_group_id: None,
                                  expand_group_id: None,
                                  branch_name: None,
                                  step_in_pipeline: 0,
                                  created_at: Utc::now() };
        self.landscape.insert_token(&token, &[])?;
        Ok(token)
    }

    /// Fork: un hijo por branch, padre terminal FORKED con el contrato de
    /// branches persistido para recovery.
    pub fn fork(&self,
                run_id: Uuid,
                parent: &TokenRecord,
                branches: &[String],
                step: u32)
                -> Result<(Vec<TokenRecord>, Uuid), RecorderError> {
        let fork_group_id = Uuid::new_v4();
        let now = Utc::now();
        let children: Vec<TokenRecord> = branches.iter()
                                                 .map(|branch| TokenRecord { token_id: Uuid::new_v4(),
                                                                             row_id: parent.row_id.clone(),
                                                                             fork_group_id: Some(fork_group_id),
                                                                             join_group_id: None,
                                                                             expand_group_id: None,
                                                                             branch_name: Some(branch.clone()),
                                                                             step_in_pipeline: step,
                                                                             created_at: now })
                                                 .collect();
        let links: Vec<TokenParentRecord> = children.iter()
                                                    .map(|c| TokenParentRecord { token_id: c.token_id,
                                                                                 parent_token_id: parent.token_id,
                                                                                 ordinal: 0 })
                                                    .collect();
        let mut outcome = OutcomeRecord::terminal(run_id, parent.token_id, TokenOutcomeKind::Forked);
        outcome.fork_group_id = Some(fork_group_id);
        outcome.expected_branches_json = Some(json!(branches));

        self.landscape.record_branching(&outcome, &children, &links)?;
        Ok((children, fork_group_id))
    }

    /// Expand: un hijo por fila producida; el contrato registra el conteo
    /// prometido.
    pub fn expand(&self,
                  run_id: Uuid,
                  parent: &TokenRecord,
                  row_count: usize,
                  step: u32)
                  -> Result<(Vec<TokenRecord>, Uuid), RecorderError> {
        let expand_group_id = Uuid::new_v4();
        let now = Utc::now();
        let children: Vec<TokenRecord> = (0..row_count).map(|_| TokenRecord { token_id: Uuid::new_v4(),
                                                                              row_id: parent.row_id.clone(),
                                                                              fork_group_id: None,
                                                                              join_group_id: None,
                                                                              expand_group_id: Some(expand_group_id),
                                                                              branch_name: None,
                                                                              step_in_pipeline: step,
                                                                              created_at: now })
                                                       .collect();
        let links: Vec<TokenParentRecord> = children.iter()
                                                    .map(|c| TokenParentRecord { token_id: c.token_id,
                                                                                 parent_token_id: parent.token_id,
                                                                                 ordinal: 0 })
                                                    .collect();
        let mut outcome = OutcomeRecord::terminal(run_id, parent.token_id, TokenOutcomeKind::Expanded);
        outcome.expand_group_id = Some(expand_group_id);
        outcome.expected_branches_json = Some(json!(row_count));

        self.landscape.record_branching(&outcome, &children, &links)?;
        Ok((children, expand_group_id))
    }

    /// Coalesce: token fusionado con padres en orden de llegada; cada input
    /// queda terminal COALESCED bajo el mismo `join_group_id`.
    ///
    /// Nota: COALESCED nunca lleva `error_hash`; el fallo de un branch
    /// descartado queda registrado como FAILED en el token que falló.
    pub fn coalesce(&self,
                    run_id: Uuid,
                    inputs: &[TokenRecord],
                    join_group_id: Uuid,
                    step: u32)
                    -> Result<TokenRecord, RecorderError> {
        let merged = TokenRecord { token_id: Uuid::new_v4(),
                                   row_id: inputs.first()
                                                 .map(|t| t.row_id.clone())
                                                 .unwrap_or_default(),
                                   fork_group_id: None,
                                   join_group_id: Some(join_group_id),
                                   expand_group_id: None,
                                   branch_name: None,
                                   step_in_pipeline: step,
                                   created_at: Utc::now() };
        let merged_parents: Vec<TokenParentRecord> = inputs.iter()
                                                           .enumerate()
                                                           .map(|(i, t)| TokenParentRecord { token_id: merged.token_id,
                                                                                             parent_token_id: t.token_id,
                                                                                             ordinal: i as u32 })
                                                           .collect();
        let input_outcomes: Vec<OutcomeRecord> = inputs.iter()
                                                       .map(|t| {
                                                           let mut o = OutcomeRecord::terminal(run_id,
                                                                                               t.token_id,
                                                                                               TokenOutcomeKind::Coalesced);
                                                           o.join_group_id = Some(join_group_id);
                                                           o
                                                       })
                                                       .collect();

        self.landscape.record_coalesce(&merged, &merged_parents, &input_outcomes)?;
        Ok(merged)
    }

    /// Flush de aggregation: crea el token de salida del batch con los
    /// miembros como padres (en orden de buffer) y marca cada miembro
    /// terminal CONSUMED_IN_BATCH, en una sola operación.
    pub fn flush_batch(&self,
                       run_id: Uuid,
                       members: &[TokenRecord],
                       batch_id: Uuid,
                       step: u32)
                       -> Result<TokenRecord, RecorderError> {
        let merged = TokenRecord { token_id: Uuid::new_v4(),
                                   row_id: members.first()
                                                  .map(|t| t.row_id.clone())
                                                  .unwrap_or_default(),
                                   fork_group_id: None,
                                   join_group_id: None,
                                   expand_group_id: None,
                                   branch_name: None,
                                   step_in_pipeline: step,
                                   created_at: Utc::now() };
        let merged_parents: Vec<TokenParentRecord> = members.iter()
                                                            .enumerate()
                                                            .map(|(i, t)| TokenParentRecord { token_id: merged.token_id,
                                                                                              parent_token_id: t.token_id,
                                                                                              ordinal: i as u32 })
                                                            .collect();
        let member_outcomes: Vec<OutcomeRecord> =
            members.iter()
                   .map(|t| {
                       let mut o = OutcomeRecord::terminal(run_id, t.token_id, TokenOutcomeKind::ConsumedInBatch);
                       o.batch_id = Some(batch_id);
                       o
                   })
                   .collect();
        self.landscape.record_coalesce(&merged, &merged_parents, &member_outcomes)?;
        Ok(merged)
    }

    /// BUFFERED: el único outcome no terminal. El índice único parcial
    /// permite que después llegue el CONSUMED_IN_BATCH terminal.
    pub fn buffer(&self, run_id: Uuid, token_id: Uuid, batch_id: Uuid) -> Result<(), RecorderError> {
        let mut outcome = OutcomeRecord::terminal(run_id, token_id, TokenOutcomeKind::Buffered);
        outcome.is_terminal = false;
        outcome.batch_id = Some(batch_id);
        self.landscape.record_outcome(&outcome)
    }

    pub fn consume_in_batch(&self, run_id: Uuid, token_id: Uuid, batch_id: Uuid) -> Result<(), RecorderError> {
        let mut outcome = OutcomeRecord::terminal(run_id, token_id, TokenOutcomeKind::ConsumedInBatch);
        outcome.batch_id = Some(batch_id);
        self.landscape.record_outcome(&outcome)
    }

    pub fn completed(&self, run_id: Uuid, token_id: Uuid, sink_name: &str) -> Result<(), RecorderError> {
        let mut outcome = OutcomeRecord::terminal(run_id, token_id, TokenOutcomeKind::Completed);
        outcome.sink_name = Some(sink_name.to_string());
        self.landscape.record_outcome(&outcome)
    }

    pub fn routed(&self, run_id: Uuid, token_id: Uuid, sink_name: &str) -> Result<(), RecorderError> {
        let mut outcome = OutcomeRecord::terminal(run_id, token_id, TokenOutcomeKind::Routed);
        outcome.sink_name = Some(sink_name.to_string());
        self.landscape.record_outcome(&outcome)
    }

    pub fn failed(&self, run_id: Uuid, token_id: Uuid, error_hash: &str) -> Result<(), RecorderError> {
        let mut outcome = OutcomeRecord::terminal(run_id, token_id, TokenOutcomeKind::Failed);
        outcome.error_hash = Some(error_hash.to_string());
        self.landscape.record_outcome(&outcome)
    }

    pub fn quarantined(&self, run_id: Uuid, token_id: Uuid, error_hash: &str) -> Result<(), RecorderError> {
        let mut outcome = OutcomeRecord::terminal(run_id, token_id, TokenOutcomeKind::Quarantined);
        outcome.error_hash = Some(error_hash.to_string());
        self.landscape.record_outcome(&outcome)
    }
}
