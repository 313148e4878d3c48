//! Recovery manager (C8): identifica filas sin procesar de un run previo.
//!
//! Derivación (sin mutación retroactiva; `token_outcomes` es autoritativo):
//! una fila queda sin procesar si
//! - algún token de su familia no tiene outcome terminal, o
//! - algún padre FORKED/EXPANDED tiene el contrato de branches sin cumplir:
//!   el multiset de `branch_name` de sus hijos vivos no iguala el
//!   `expected_branches_json` registrado (para expand, el conteo prometido).
//!
//! Un resume reutiliza los `row_id` originales (la derivación
//! posición + hash de contenido es determinista), así el run nuevo procesa
//! exactamente el conjunto reportado.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::landscape::{Landscape, OutcomeRecord, RowRecord, TokenOutcomeKind, TokenRecord};

/// Plan de reanudación: las filas a reprocesar y el run del que vienen.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub previous_run_id: Uuid,
    pub unprocessed: Vec<RowRecord>,
}

impl RecoveryPlan {
    /// Set de `row_id`s para filtrar el bombeo de la fuente en el resume.
    pub fn row_filter(&self) -> HashSet<String> {
        self.unprocessed.iter().map(|r| r.row_id.clone()).collect()
    }
}

pub struct RecoveryManager {
    landscape: Arc<dyn Landscape>,
}

impl RecoveryManager {
    pub fn new(landscape: Arc<dyn Landscape>) -> Self {
        Self { landscape }
    }

    /// Filas del run cuyo procesamiento no quedó completo.
    pub fn unprocessed_rows(&self, run_id: Uuid) -> Result<Vec<RowRecord>, EngineError> {
        let rows = self.landscape.rows_for_run(run_id)?;
        let tokens = self.landscape.tokens_for_run(run_id)?;
        let outcomes = self.landscape.outcomes_for_run(run_id)?;

        let mut tokens_by_row: HashMap<&str, Vec<&TokenRecord>> = HashMap::new();
        for token in &tokens {
            tokens_by_row.entry(token.row_id.as_str()).or_default().push(token);
        }
        let terminal_by_token: HashMap<Uuid, &OutcomeRecord> = outcomes.iter()
                                                                       .filter(|o| o.is_terminal)
                                                                       .map(|o| (o.token_id, o))
                                                                       .collect();
        let mut children_by_fork: HashMap<Uuid, Vec<&TokenRecord>> = HashMap::new();
        let mut children_by_expand: HashMap<Uuid, Vec<&TokenRecord>> = HashMap::new();
        for token in &tokens {
            if let Some(g) = token.fork_group_id {
                children_by_fork.entry(g).or_default().push(token);
            }
            if let Some(g) = token.expand_group_id {
                children_by_expand.entry(g).or_default().push(token);
            }
        }

        let mut unprocessed = Vec::new();
        for row in rows {
            let family = tokens_by_row.get(row.row_id.as_str());
            let complete = match family {
                None => false,
                Some(family) => {
                    family.iter().all(|t| terminal_by_token.contains_key(&t.token_id))
                    && family.iter().all(|t| {
                                    terminal_by_token.get(&t.token_id)
                                                     .map(|o| contract_fulfilled(o, &children_by_fork,
                                                                                 &children_by_expand))
                                                     .unwrap_or(false)
                                })
                }
            };
            if !complete {
                unprocessed.push(row);
            }
        }
        Ok(unprocessed)
    }

    /// Arma el plan de reanudación de `run_id`.
    pub fn plan_resume(&self, run_id: Uuid) -> Result<RecoveryPlan, EngineError> {
        // Valida que el run exista antes de derivar.
        let _ = self.landscape.run(run_id)?;
        let unprocessed = self.unprocessed_rows(run_id)?;
        Ok(RecoveryPlan { previous_run_id: run_id, unprocessed })
    }
}

/// Contrato de un padre FORKED/EXPANDED contra sus hijos vivos.
fn contract_fulfilled(outcome: &OutcomeRecord,
                      children_by_fork: &HashMap<Uuid, Vec<&TokenRecord>>,
                      children_by_expand: &HashMap<Uuid, Vec<&TokenRecord>>)
                      -> bool {
    match outcome.outcome {
        TokenOutcomeKind::Forked => {
            let expected = match &outcome.expected_branches_json {
                Some(Value::Array(branches)) => branches.iter()
                                                        .filter_map(|b| b.as_str().map(str::to_string))
                                                        .collect::<Vec<_>>(),
                _ => return false,
            };
            let group = match outcome.fork_group_id {
                Some(g) => g,
                None => return false,
            };
            let empty = Vec::new();
            let children = children_by_fork.get(&group).unwrap_or(&empty);
            multiset(&expected)
            == multiset(&children.iter()
                                 .filter_map(|c| c.branch_name.clone())
                                 .collect::<Vec<_>>())
        }
        TokenOutcomeKind::Expanded => {
            let expected = outcome.expected_branches_json
                                  .as_ref()
                                  .and_then(|v| v.as_u64())
                                  .unwrap_or(u64::MAX);
            let group = match outcome.expand_group_id {
                Some(g) => g,
                None => return false,
            };
            let count = children_by_expand.get(&group).map(|c| c.len() as u64).unwrap_or(0);
            count == expected
        }
        _ => true,
    }
}

fn multiset(items: &[String]) -> HashMap<&str, usize> {
    let mut set: HashMap<&str, usize> = HashMap::new();
    for item in items {
        *set.entry(item.as_str()).or_insert(0) += 1;
    }
    set
}
