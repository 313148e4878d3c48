//! Reconstrucción de linaje (explain): estabilidad e idempotencia.

mod support;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use elspeth_adapters::PassthroughTransform;
use elspeth_core::graph::{ExecutionGraph, NodeExecutor, NodeKind};
use elspeth_core::landscape::{InMemoryLandscape, Landscape, TokenOutcomeKind};
use elspeth_core::lineage;
use elspeth_core::plugin::{ErrorDisposition, TransformPlugin};

use support::{memory_sink, move_edge, node, run_pipeline};

fn run_simple() -> (Arc<dyn Landscape>, uuid::Uuid) {
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("seed", NodeKind::Source)).unwrap();
    graph.add_node(node("t1", NodeKind::Transform)).unwrap();
    graph.add_node(node("out", NodeKind::Sink)).unwrap();
    graph.add_edge(move_edge("seed", "t1", "continue")).unwrap();
    graph.add_edge(move_edge("t1", "out", "continue")).unwrap();

    let (_captured, sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("t1".to_string(),
                     NodeExecutor::Transform { plugin: Box::new(PassthroughTransform::new())
                                                       as Box<dyn TransformPlugin>,
                                               on_error: ErrorDisposition::Discard });
    executors.insert("out".to_string(), sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let report = run_pipeline(graph, executors, vec![json!({"id": 1})], "seed", "out",
                              Arc::clone(&landscape)).expect("run ok");
    (landscape, report.run_id)
}

#[test]
fn explain_reconstructs_the_full_sequence_for_a_row() {
    let (landscape, run_id) = run_simple();
    let row_id = landscape.rows_for_run(run_id).unwrap()[0].row_id.clone();

    let report = lineage::explain_row(&landscape, run_id, &row_id).expect("explain");
    assert_eq!(report.row_id, row_id);
    assert_eq!(report.tokens.len(), 1);

    let token = &report.tokens[0];
    let visited: Vec<&str> = token.node_states.iter().map(|s| s.node_id.as_str()).collect();
    assert_eq!(visited, vec!["t1", "out"], "exact node sequence");
    let outcome = token.outcome.as_ref().expect("terminal outcome present");
    assert_eq!(outcome.outcome, TokenOutcomeKind::Completed);
    assert!(token.derived_outcome.is_none(), "explicit outcomes need no derivation");
}

#[test]
fn explain_is_idempotent_and_stable_on_a_finalised_run() {
    // Dos lecturas del mismo run finalizado producen el mismo JSON.
    let (landscape, run_id) = run_simple();
    let row_id = landscape.rows_for_run(run_id).unwrap()[0].row_id.clone();

    let first = lineage::explain_row(&landscape, run_id, &row_id).expect("first explain");
    let second = lineage::explain_row(&landscape, run_id, &row_id).expect("second explain");
    assert_eq!(serde_json::to_string(&first).unwrap(), serde_json::to_string(&second).unwrap());
}

#[test]
fn explain_token_resolves_the_whole_row_family() {
    let (landscape, run_id) = run_simple();
    let token_id = landscape.tokens_for_run(run_id).unwrap()[0].token_id;

    let report = lineage::explain_token(&landscape, run_id, token_id).expect("explain by token");
    assert_eq!(report.tokens.len(), 1);
    assert_eq!(report.tokens[0].token.token_id, token_id);
}

#[test]
fn tokens_without_outcome_get_a_structural_derivation() {
    // Token legacy sin outcome explícito pero con hijos: derivación de sólo
    // lectura "forked (derived)".
    use chrono::Utc;
    use elspeth_core::landscape::{RowRecord, RunRecord, RunStatus, TokenParentRecord, TokenRecord};
    use uuid::Uuid;

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let run_id = Uuid::new_v4();
    landscape.create_run(&RunRecord { run_id,
                                      started_at: Utc::now(),
                                      finished_at: None,
                                      status: RunStatus::Finished,
                                      config_fingerprint: "fp".to_string() })
             .unwrap();
    landscape.record_row(&RowRecord { row_id: "legacy-0".to_string(),
                                      run_id,
                                      source_position: 0,
                                      content_hash: "h".to_string() })
             .unwrap();

    let parent = TokenRecord { token_id: Uuid::new_v4(),
                               row_id: "legacy-0".to_string(),
                               fork_group_id: None,
                               join_group_id: None,
                               expand_group_id: None,
                               branch_name: None,
                               step_in_pipeline: 0,
                               created_at: Utc::now() };
    landscape.insert_token(&parent, &[]).unwrap();
    let child = TokenRecord { token_id: Uuid::new_v4(),
                              row_id: "legacy-0".to_string(),
                              fork_group_id: Some(Uuid::new_v4()),
                              join_group_id: None,
                              expand_group_id: None,
                              branch_name: Some("a".to_string()),
                              step_in_pipeline: 1,
                              created_at: Utc::now() };
    landscape.insert_token(&child, &[TokenParentRecord { token_id: child.token_id,
                                                         parent_token_id: parent.token_id,
                                                         ordinal: 0 }])
             .unwrap();

    let report = lineage::explain_row(&landscape, run_id, "legacy-0").expect("explain");
    let parent_lineage = report.tokens
                               .iter()
                               .find(|t| t.token.token_id == parent.token_id)
                               .expect("parent present");
    assert!(parent_lineage.outcome.is_none());
    assert_eq!(parent_lineage.derived_outcome.as_deref(), Some("forked (derived)"));
}
