//! Integración Postgres del landscape. Requiere DATABASE_URL; sin ella los
//! tests se saltean (entornos de CI sin Postgres).

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use elspeth_core::errors::RecorderError;
use elspeth_core::landscape::{Landscape, NodeStateClose, NodeStateRecord, NodeStateStatus, RowRecord, RunRecord,
                              RunStatus, TokenOutcomeKind};
use elspeth_core::TokenManager;
use elspeth_persistence::{build_dev_pool_from_env, PgLandscape, PoolProvider};

fn pg_landscape() -> Option<Arc<dyn Landscape>> {
    let pool = match build_dev_pool_from_env() {
        Ok(Some(pool)) => pool,
        Ok(None) => {
            eprintln!("DATABASE_URL not set - skipping PG integration test");
            return None;
        }
        Err(e) => panic!("pool build failed: {e}"),
    };
    Some(Arc::new(PgLandscape::new(PoolProvider { pool })))
}

fn fresh_run(landscape: &Arc<dyn Landscape>) -> Uuid {
    let run_id = Uuid::new_v4();
    landscape.create_run(&RunRecord { run_id,
                                      started_at: Utc::now(),
                                      finished_at: None,
                                      status: RunStatus::Running,
                                      config_fingerprint: "pg-test".to_string() })
             .expect("create run");
    run_id
}

fn register_row(landscape: &Arc<dyn Landscape>, run_id: Uuid, row_id: &str) {
    landscape.record_row(&RowRecord { row_id: row_id.to_string(),
                                      run_id,
                                      source_position: 0,
                                      content_hash: "hash".to_string() })
             .expect("record row");
}

#[test]
fn partial_unique_index_rejects_second_terminal_outcome() {
    // El doble insert terminal viola
    // token_outcomes_one_terminal.
    let Some(landscape) = pg_landscape() else { return };
    let run_id = fresh_run(&landscape);
    let row_id = format!("row-{}", Uuid::new_v4());
    register_row(&landscape, run_id, &row_id);

    let manager = TokenManager::new(Arc::clone(&landscape));
    let token = manager.create_initial(&row_id).expect("token");

    manager.completed(run_id, token.token_id, "out").expect("first terminal");
    let err = manager.routed(run_id, token.token_id, "elsewhere").expect_err("second terminal rejected");
    assert!(matches!(err, RecorderError::DuplicateTerminal(id) if id == token.token_id));
}

#[test]
fn buffered_then_terminal_passes_the_partial_index() {
    // BUFFERED (is_terminal = false) no participa del índice.
    let Some(landscape) = pg_landscape() else { return };
    let run_id = fresh_run(&landscape);
    let row_id = format!("row-{}", Uuid::new_v4());
    register_row(&landscape, run_id, &row_id);

    let manager = TokenManager::new(Arc::clone(&landscape));
    let token = manager.create_initial(&row_id).expect("token");
    let batch_id = Uuid::new_v4();

    manager.buffer(run_id, token.token_id, batch_id).expect("buffered");
    manager.consume_in_batch(run_id, token.token_id, batch_id).expect("terminal after buffered");

    let outcomes = landscape.outcomes_for_token(token.token_id).expect("outcomes");
    assert_eq!(outcomes.len(), 2);
}

#[test]
fn fork_children_and_parent_outcome_commit_together() {
    let Some(landscape) = pg_landscape() else { return };
    let run_id = fresh_run(&landscape);
    let row_id = format!("row-{}", Uuid::new_v4());
    register_row(&landscape, run_id, &row_id);

    let manager = TokenManager::new(Arc::clone(&landscape));
    let parent = manager.create_initial(&row_id).expect("parent");
    let branches = vec!["a".to_string(), "b".to_string()];
    let (children, fork_group_id) = manager.fork(run_id, &parent, &branches, 1).expect("fork");

    let outcome = landscape.terminal_outcome(parent.token_id)
                           .expect("query")
                           .expect("parent terminal");
    assert_eq!(outcome.outcome, TokenOutcomeKind::Forked);
    assert_eq!(outcome.expected_branches_json, Some(json!(["a", "b"])));

    for child in &children {
        let stored = landscape.token(child.token_id).expect("child persisted");
        assert_eq!(stored.fork_group_id, Some(fork_group_id));
        let parents = landscape.parents_of(child.token_id).expect("links");
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].parent_token_id, parent.token_id);
    }
}

#[test]
fn fork_on_terminal_parent_rolls_back_children() {
    // Atomicidad real: la transacción entera revierte, sin hijos huérfanos.
    let Some(landscape) = pg_landscape() else { return };
    let run_id = fresh_run(&landscape);
    let row_id = format!("row-{}", Uuid::new_v4());
    register_row(&landscape, run_id, &row_id);

    let manager = TokenManager::new(Arc::clone(&landscape));
    let parent = manager.create_initial(&row_id).expect("parent");
    manager.completed(run_id, parent.token_id, "out").expect("terminal");

    let err = manager.fork(run_id, &parent, &["a".to_string()], 1).expect_err("fork rejected");
    assert!(matches!(err, RecorderError::DuplicateTerminal(_)));

    let tokens = landscape.tokens_for_run(run_id).expect("tokens");
    assert_eq!(tokens.len(), 1, "no orphan children after rollback");
}

#[test]
fn node_state_close_is_a_single_pending_to_terminal_update() {
    let Some(landscape) = pg_landscape() else { return };
    let run_id = fresh_run(&landscape);
    let row_id = format!("row-{}", Uuid::new_v4());
    register_row(&landscape, run_id, &row_id);

    let manager = TokenManager::new(Arc::clone(&landscape));
    let token = manager.create_initial(&row_id).expect("token");

    let state = NodeStateRecord { state_id: Uuid::new_v4(),
                                  token_id: token.token_id,
                                  node_id: "t1".to_string(),
                                  attempt: 1,
                                  status: NodeStateStatus::Pending,
                                  input_hash: "in".to_string(),
                                  output_hash: None,
                                  started_at: Utc::now(),
                                  completed_at: None,
                                  duration_ms: None,
                                  error_json: None,
                                  success_reason_json: Some(json!({"action": "noop"})),
                                  context_before_json: None,
                                  context_after_json: None };
    landscape.open_node_state(&state).expect("open");

    let close = NodeStateClose { status: NodeStateStatus::Completed,
                                 output_hash: Some("out".to_string()),
                                 completed_at: Utc::now(),
                                 duration_ms: 3,
                                 error_json: None,
                                 success_reason_json: Some(json!({"action": "noop"})),
                                 context_after_json: None };
    landscape.close_node_state(state.state_id, &close).expect("close");
    assert!(matches!(landscape.close_node_state(state.state_id, &close),
                     Err(RecorderError::NodeStateAlreadyClosed(_))));

    let states = landscape.node_states_for_token(token.token_id).expect("states");
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status, NodeStateStatus::Completed);
    assert_eq!(states[0].output_hash.as_deref(), Some("out"));
}

#[test]
fn outcome_rows_round_trip_through_postgres() {
    let Some(landscape) = pg_landscape() else { return };
    let run_id = fresh_run(&landscape);
    let row_id = format!("row-{}", Uuid::new_v4());
    register_row(&landscape, run_id, &row_id);

    let manager = TokenManager::new(Arc::clone(&landscape));
    let token = manager.create_initial(&row_id).expect("token");
    manager.quarantined(run_id, token.token_id, "feedface").expect("quarantined");

    let outcome = landscape.terminal_outcome(token.token_id)
                           .expect("query")
                           .expect("terminal");
    assert_eq!(outcome.outcome, TokenOutcomeKind::Quarantined);
    assert_eq!(outcome.error_hash.as_deref(), Some("feedface"));
    assert_eq!(outcome.run_id, run_id);
}
