//! Comportamiento del procesador por (token, nodo): retries, disposición de
//! errores, expand y guards.

mod support;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use elspeth_adapters::{FlakyTransform, PassthroughTransform, SetFieldsTransform, SplitTransform};
use elspeth_core::graph::{EdgeMode, ExecutionGraph, GraphEdge, NodeExecutor, NodeKind};
use elspeth_core::landscape::{InMemoryLandscape, Landscape, NodeStateStatus, TokenOutcomeKind};
use elspeth_core::plugin::{ErrorDisposition, PluginErrorKind, TransformPlugin};

use support::{memory_sink, move_edge, node, run_pipeline};

fn transform_executor(plugin: Box<dyn TransformPlugin>, on_error: ErrorDisposition) -> NodeExecutor {
    NodeExecutor::Transform { plugin, on_error }
}

/// Grafo lineal source -> t1 -> out con el transform dado.
fn linear_graph() -> ExecutionGraph {
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("seed", NodeKind::Source)).unwrap();
    graph.add_node(node("t1", NodeKind::Transform)).unwrap();
    graph.add_node(node("out", NodeKind::Sink)).unwrap();
    graph.add_edge(move_edge("seed", "t1", "continue")).unwrap();
    graph.add_edge(move_edge("t1", "out", "continue")).unwrap();
    graph
}

#[test]
fn retry_budget_exhaustion_records_attempts_and_fails_token() {
    // Tres errores retryables con presupuesto 3: tres node_states
    // failed, outcome FAILED con error_hash; la fila siguiente pasa normal.
    let flaky = FlakyTransform::new(vec![PluginErrorKind::RateLimit,
                                         PluginErrorKind::RateLimit,
                                         PluginErrorKind::RateLimit]);
    let graph = linear_graph();
    let (captured, sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("t1".to_string(), transform_executor(Box::new(flaky), ErrorDisposition::Discard));
    executors.insert("out".to_string(), sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let rows = vec![json!({"id": 1}), json!({"id": 2})];
    let report = run_pipeline(graph, executors, rows, "seed", "out", Arc::clone(&landscape)).expect("run ok");

    assert_eq!(report.failed, 1);
    assert_eq!(report.completed, 1, "next row proceeds normally");
    assert_eq!(*captured.lock().unwrap(), vec![json!({"id": 2})]);

    let outcomes = landscape.outcomes_for_run(report.run_id).unwrap();
    let failed = outcomes.iter().find(|o| o.outcome == TokenOutcomeKind::Failed).expect("failed outcome");
    assert!(failed.error_hash.is_some());

    let states = landscape.node_states_for_token(failed.token_id).unwrap();
    let attempts: Vec<u32> = states.iter().filter(|s| s.node_id == "t1").map(|s| s.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3], "three failed attempts, strictly ordered");
    assert!(states.iter()
                  .filter(|s| s.node_id == "t1")
                  .all(|s| s.status == NodeStateStatus::Failed && s.error_json.is_some()));
}

#[test]
fn non_retryable_error_fails_without_retry() {
    let flaky = FlakyTransform::new(vec![PluginErrorKind::Forbidden]);
    let graph = linear_graph();
    let (_captured, sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("t1".to_string(), transform_executor(Box::new(flaky), ErrorDisposition::Discard));
    executors.insert("out".to_string(), sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let report = run_pipeline(graph, executors, vec![json!({"id": 1})], "seed", "out",
                              Arc::clone(&landscape)).expect("run ok");

    assert_eq!(report.failed, 1);
    let outcomes = landscape.outcomes_for_run(report.run_id).unwrap();
    let failed = outcomes.iter().find(|o| o.outcome == TokenOutcomeKind::Failed).expect("failed outcome");
    let states = landscape.node_states_for_token(failed.token_id).unwrap();
    assert_eq!(states.iter().filter(|s| s.node_id == "t1").count(), 1, "no retries for terminal kinds");
}

#[test]
fn on_error_sink_diverts_failed_rows_as_routed() {
    // on_error = sink: la fila desvía por el edge DIVERT y queda ROUTED en
    // el sink de errores.
    let flaky = FlakyTransform::new(vec![PluginErrorKind::Forbidden]);
    let mut graph = linear_graph();
    graph.add_node(node("errors", NodeKind::Sink)).unwrap();
    graph.add_edge(GraphEdge::new("t1", "errors", "__error_0__", EdgeMode::Divert)).unwrap();

    let (error_rows, error_sink) = memory_sink(false);
    let (ok_rows, ok_sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("t1".to_string(),
                     transform_executor(Box::new(flaky), ErrorDisposition::Sink("errors".to_string())));
    executors.insert("out".to_string(), ok_sink);
    executors.insert("errors".to_string(), error_sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let rows = vec![json!({"id": 1}), json!({"id": 2})];
    let report = run_pipeline(graph, executors, rows, "seed", "out", Arc::clone(&landscape)).expect("run ok");

    assert_eq!(report.routed, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(*error_rows.lock().unwrap(), vec![json!({"id": 1})]);
    assert_eq!(*ok_rows.lock().unwrap(), vec![json!({"id": 2})]);

    let outcomes = landscape.outcomes_for_run(report.run_id).unwrap();
    let routed = outcomes.iter().find(|o| o.outcome == TokenOutcomeKind::Routed).expect("routed outcome");
    assert_eq!(routed.sink_name.as_deref(), Some("errors"));
}

#[test]
fn field_collision_is_an_error_not_a_silent_overwrite() {
    // set_fields declara fields_added = ["id"]; la fila ya trae "id".
    let mut fields = serde_json::Map::new();
    fields.insert("id".to_string(), json!(999));
    let transform = SetFieldsTransform::new(fields);

    let graph = linear_graph();
    let (captured, sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("t1".to_string(), transform_executor(Box::new(transform), ErrorDisposition::Discard));
    executors.insert("out".to_string(), sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let report = run_pipeline(graph, executors, vec![json!({"id": 1})], "seed", "out",
                              Arc::clone(&landscape)).expect("run ok");

    assert_eq!(report.quarantined, 1, "collision quarantines the row");
    assert!(captured.lock().unwrap().is_empty(), "nothing reaches the sink");

    let outcomes = landscape.outcomes_for_run(report.run_id).unwrap();
    let quarantined = outcomes.iter()
                              .find(|o| o.outcome == TokenOutcomeKind::Quarantined)
                              .expect("quarantined outcome");
    assert!(quarantined.error_hash.is_some());
}

#[test]
fn success_multi_expands_one_child_per_row() {
    let graph = linear_graph();
    let (captured, sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("t1".to_string(),
                     transform_executor(Box::new(SplitTransform::new("items")), ErrorDisposition::Discard));
    executors.insert("out".to_string(), sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let rows = vec![json!({"id": 1, "items": ["x", "y", "z"]})];
    let report = run_pipeline(graph, executors, rows, "seed", "out", Arc::clone(&landscape)).expect("run ok");

    assert_eq!(report.expanded, 1);
    assert_eq!(report.completed, 3, "one child per produced row");
    assert_eq!(captured.lock().unwrap().len(), 3);

    let outcomes = landscape.outcomes_for_run(report.run_id).unwrap();
    let expanded = outcomes.iter()
                           .find(|o| o.outcome == TokenOutcomeKind::Expanded)
                           .expect("expanded parent");
    assert_eq!(expanded.expected_branches_json, Some(json!(3)));

    // Contrato de expand: hijos vivos == conteo prometido.
    let tokens = landscape.tokens_for_run(report.run_id).unwrap();
    let children = tokens.iter()
                         .filter(|t| t.expand_group_id == expanded.expand_group_id && t.expand_group_id.is_some())
                         .count();
    assert_eq!(children, 3);
}

#[test]
fn deterministic_transform_has_functional_input_output_hashes() {
    // Para un plugin determinista, mismo input_hash => mismo
    // output_hash entre ejecuciones.
    let graph = linear_graph();
    let (_captured, sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("t1".to_string(),
                     transform_executor(Box::new(PassthroughTransform::new()), ErrorDisposition::Discard));
    executors.insert("out".to_string(), sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    // La misma fila dos veces: tokens distintos, mismos hashes.
    let rows = vec![json!({"id": 42}), json!({"id": 42})];
    let report = run_pipeline(graph, executors, rows, "seed", "out", Arc::clone(&landscape)).expect("run ok");
    assert_eq!(report.completed, 2);

    let tokens = landscape.tokens_for_run(report.run_id).unwrap();
    let mut pairs: Vec<(String, Option<String>)> = Vec::new();
    for token in tokens {
        for state in landscape.node_states_for_token(token.token_id).unwrap() {
            if state.node_id == "t1" {
                pairs.push((state.input_hash, state.output_hash));
            }
        }
    }
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0], pairs[1], "input_hash -> output_hash is a function");
    assert!(pairs[0].1.is_some());
}
