//! Reconstrucción de linaje ("explain") desde el landscape.
//!
//! Para una fila o un token reconstruye la secuencia exacta de node_states,
//! routing_events y el outcome terminal. Es una lectura pura: idempotente y
//! estable sobre un run finalizado (el orden es por timestamp de creación
//! con `token_id` como desempate).
//!
//! Tokens legacy sin outcome explícito reciben una derivación estructural
//! sólo para reporte (existencia de hijos, membresía de batch); nunca se
//! escribe de vuelta.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::landscape::{Landscape, NodeStateRecord, OutcomeRecord, RoutingEventRecord, RunRecord, TokenParentRecord,
                       TokenRecord};

/// Linaje de un token: sus estados por nodo (ordenados por attempt), los
/// routing events de cada decisión y su disposición final.
#[derive(Debug, Clone, Serialize)]
pub struct TokenLineage {
    pub token: TokenRecord,
    pub parents: Vec<TokenParentRecord>,
    pub node_states: Vec<NodeStateRecord>,
    pub routing_events: Vec<RoutingEventRecord>,
    pub outcome: Option<OutcomeRecord>,
    /// Derivación estructural para tokens legacy sin outcome registrado.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derived_outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineageReport {
    pub run: RunRecord,
    pub row_id: String,
    pub tokens: Vec<TokenLineage>,
}

/// Linaje completo de la familia de tokens de una fila.
pub fn explain_row(landscape: &Arc<dyn Landscape>, run_id: Uuid, row_id: &str) -> Result<LineageReport, EngineError> {
    let run = landscape.run(run_id)?;
    let mut family: Vec<TokenRecord> = landscape.tokens_for_run(run_id)?
                                                .into_iter()
                                                .filter(|t| t.row_id == row_id)
                                                .collect();
    family.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.token_id.cmp(&b.token_id)));

    let mut tokens = Vec::with_capacity(family.len());
    for token in family {
        tokens.push(token_lineage(landscape, run_id, token)?);
    }
    Ok(LineageReport { run, row_id: row_id.to_string(), tokens })
}

/// Linaje de un token puntual (la fila se resuelve desde el token).
pub fn explain_token(landscape: &Arc<dyn Landscape>, run_id: Uuid, token_id: Uuid) -> Result<LineageReport, EngineError> {
    let token = landscape.token(token_id)?;
    explain_row(landscape, run_id, &token.row_id)
}

fn token_lineage(landscape: &Arc<dyn Landscape>, run_id: Uuid, token: TokenRecord) -> Result<TokenLineage, EngineError> {
    let parents = landscape.parents_of(token.token_id)?;
    let node_states = landscape.node_states_for_token(token.token_id)?;
    let mut routing_events = Vec::new();
    for state in &node_states {
        routing_events.extend(landscape.routing_for_state(state.state_id)?);
    }
    let outcome = landscape.terminal_outcome(token.token_id)?;
    let derived_outcome = if outcome.is_none() {
        derive_structural(landscape, run_id, &token)?
    } else {
        None
    };
    Ok(TokenLineage { token,
                      parents,
                      node_states,
                      routing_events,
                      outcome,
                      derived_outcome })
}

/// Fallback estructural de sólo lectura para tokens sin outcome explícito:
/// hijos con su fork/expand group → forked/expanded; membresía vía outcome
/// BUFFERED → buffered.
fn derive_structural(landscape: &Arc<dyn Landscape>,
                     run_id: Uuid,
                     token: &TokenRecord)
                     -> Result<Option<String>, EngineError> {
    let non_terminal = landscape.outcomes_for_token(token.token_id)?;
    if non_terminal.iter().any(|o| o.batch_id.is_some()) {
        return Ok(Some("buffered (derived)".to_string()));
    }
    // Existencia de hijos: el token aparece como padre de otro.
    let row_tokens = landscape.tokens_for_run(run_id)?;
    for candidate in row_tokens.iter().filter(|t| t.row_id == token.row_id) {
        let parents = landscape.parents_of(candidate.token_id)?;
        if parents.iter().any(|p| p.parent_token_id == token.token_id) {
            let derived = if candidate.join_group_id.is_some() {
                "coalesced (derived)"
            } else if candidate.expand_group_id.is_some() {
                "expanded (derived)"
            } else {
                "forked (derived)"
            };
            return Ok(Some(derived.to_string()));
        }
    }
    Ok(None)
}
