//! Escenarios end-to-end del orquestador sobre el backend in-memory.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use elspeth_adapters::{BatchStatsTransform, ConditionGate, PassthroughTransform};
use elspeth_core::graph::{CoalescePolicy, CoalesceStrategy, EdgeMode, ExecutionGraph, GraphEdge, NodeExecutor,
                          NodeKind, Trigger};
use elspeth_core::landscape::{InMemoryLandscape, Landscape, NodeStateStatus, TokenOutcomeKind};
use elspeth_core::plugin::{ErrorDisposition, GatePlugin, TransformPlugin};

use support::{memory_sink, move_edge, node, run_pipeline};

fn passthrough_executor() -> NodeExecutor {
    NodeExecutor::Transform { plugin: Box::new(PassthroughTransform::new()) as Box<dyn TransformPlugin>,
                              on_error: ErrorDisposition::Discard }
}

fn condition_gate(options: serde_json::Value) -> NodeExecutor {
    let plugin: Box<dyn GatePlugin> = ConditionGate::from_options(&options).expect("gate options");
    NodeExecutor::Gate { plugin }
}

#[test]
fn simple_passthrough_pipeline_completes_rows_in_order() {
    // source -> passthrough -> sink; dos filas, en orden.
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("seed", NodeKind::Source)).unwrap();
    graph.add_node(node("passthrough", NodeKind::Transform)).unwrap();
    graph.add_node(node("out", NodeKind::Sink)).unwrap();
    graph.add_edge(move_edge("seed", "passthrough", "continue")).unwrap();
    graph.add_edge(move_edge("passthrough", "out", "continue")).unwrap();

    let (captured, sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("passthrough".to_string(), passthrough_executor());
    executors.insert("out".to_string(), sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let rows = vec![json!({"id": 1, "v": "a"}), json!({"id": 2, "v": "b"})];
    let report = run_pipeline(graph, executors, rows, "seed", "out", Arc::clone(&landscape)).expect("run ok");

    assert_eq!(report.rows_read, 2);
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 0);
    assert!(!report.is_partial());

    let written = captured.lock().unwrap();
    assert_eq!(*written, vec![json!({"id": 1, "v": "a"}), json!({"id": 2, "v": "b"})]);

    // Dos tokens COMPLETED y un node_state del sink por token.
    let outcomes = landscape.outcomes_for_run(report.run_id).unwrap();
    let completed: Vec<_> = outcomes.iter()
                                    .filter(|o| o.outcome == TokenOutcomeKind::Completed)
                                    .collect();
    assert_eq!(completed.len(), 2);
    for outcome in completed {
        assert_eq!(outcome.sink_name.as_deref(), Some("out"));
        let states = landscape.node_states_for_token(outcome.token_id).unwrap();
        let sink_states: Vec<_> = states.iter().filter(|s| s.node_id == "out").collect();
        assert_eq!(sink_states.len(), 1);
        assert_eq!(sink_states[0].status, NodeStateStatus::Completed);
    }
}

#[test]
fn gate_routes_high_scores_to_flagged_sink() {
    // score > 50 va ROUTED a flagged_sink; el resto sigue al default.
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("seed", NodeKind::Source)).unwrap();
    graph.add_node(node("threshold", NodeKind::Gate)).unwrap();
    graph.add_node(node("default_sink", NodeKind::Sink)).unwrap();
    graph.add_node(node("flagged_sink", NodeKind::Sink)).unwrap();
    graph.add_edge(move_edge("seed", "threshold", "continue")).unwrap();
    graph.add_edge(move_edge("threshold", "default_sink", "continue")).unwrap();
    graph.add_edge(move_edge("threshold", "flagged_sink", "flag")).unwrap();

    let (default_rows, default_executor) = memory_sink(false);
    let (flagged_rows, flagged_executor) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("threshold".to_string(),
                     condition_gate(json!({"name": "threshold",
                                           "condition": "score > 50",
                                           "routes": {"flag": "flagged_sink"}})));
    executors.insert("default_sink".to_string(), default_executor);
    executors.insert("flagged_sink".to_string(), flagged_executor);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let rows = vec![json!({"id": 1, "score": 10}), json!({"id": 2, "score": 90})];
    let report = run_pipeline(graph, executors, rows, "seed", "default_sink", Arc::clone(&landscape)).expect("run ok");

    assert_eq!(report.completed, 1);
    assert_eq!(report.routed, 1);
    assert_eq!(*default_rows.lock().unwrap(), vec![json!({"id": 1, "score": 10})]);
    assert_eq!(*flagged_rows.lock().unwrap(), vec![json!({"id": 2, "score": 90})]);

    let outcomes = landscape.outcomes_for_run(report.run_id).unwrap();
    let routed: Vec<_> = outcomes.iter().filter(|o| o.outcome == TokenOutcomeKind::Routed).collect();
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].sink_name.as_deref(), Some("flagged_sink"));
}

#[test]
fn fork_and_first_complete_coalesce() {
    // Un fork a los branches a/b, transform no-op por branch, coalesce
    // first_complete, sink final.
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("seed", NodeKind::Source)).unwrap();
    graph.add_node(node("splitter", NodeKind::Gate)).unwrap();
    graph.add_node(node("noop_a", NodeKind::Transform)).unwrap();
    graph.add_node(node("noop_b", NodeKind::Transform)).unwrap();
    graph.add_node(node("join", NodeKind::Coalesce)).unwrap();
    graph.add_node(node("out", NodeKind::Sink)).unwrap();
    graph.add_edge(move_edge("seed", "splitter", "continue")).unwrap();
    graph.add_edge(GraphEdge::new("splitter", "noop_a", "a", EdgeMode::Copy)).unwrap();
    graph.add_edge(GraphEdge::new("splitter", "noop_b", "b", EdgeMode::Copy)).unwrap();
    graph.add_edge(move_edge("noop_a", "join", "continue")).unwrap();
    graph.add_edge(move_edge("noop_b", "join", "continue")).unwrap();
    graph.add_edge(move_edge("join", "out", "continue")).unwrap();

    let (captured, sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("splitter".to_string(),
                     condition_gate(json!({"name": "splitter",
                                           "condition": "true",
                                           "fork_to": ["a", "b"]})));
    executors.insert("noop_a".to_string(), passthrough_executor());
    executors.insert("noop_b".to_string(), passthrough_executor());
    executors.insert("join".to_string(),
                     NodeExecutor::Coalesce { policy: CoalescePolicy { branches: vec!["a".to_string(),
                                                                                     "b".to_string()],
                                                                       strategy: CoalesceStrategy::FirstComplete,
                                                                       timeout: Duration::from_secs(5) } });
    executors.insert("out".to_string(), sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let report = run_pipeline(graph, executors, vec![json!({"id": 1, "text": "hi"})], "seed", "out",
                              Arc::clone(&landscape)).expect("run ok");

    assert_eq!(report.forked, 1);
    assert_eq!(report.coalesced, 2);
    assert_eq!(report.completed, 1);
    assert_eq!(*captured.lock().unwrap(), vec![json!({"id": 1, "text": "hi"})]);

    let outcomes = landscape.outcomes_for_run(report.run_id).unwrap();

    // Padre FORKED con el contrato de branches persistido.
    let forked: Vec<_> = outcomes.iter().filter(|o| o.outcome == TokenOutcomeKind::Forked).collect();
    assert_eq!(forked.len(), 1);
    assert_eq!(forked[0].expected_branches_json, Some(json!(["a", "b"])));

    // Ambos hijos COALESCED bajo el mismo join group.
    let coalesced: Vec<_> = outcomes.iter().filter(|o| o.outcome == TokenOutcomeKind::Coalesced).collect();
    assert_eq!(coalesced.len(), 2);
    assert_eq!(coalesced[0].join_group_id, coalesced[1].join_group_id);

    // El token fusionado tiene dos padres en orden de llegada.
    let completed: Vec<_> = outcomes.iter().filter(|o| o.outcome == TokenOutcomeKind::Completed).collect();
    assert_eq!(completed.len(), 1);
    let merged = landscape.token(completed[0].token_id).unwrap();
    assert!(merged.join_group_id.is_some());
    let parents = landscape.parents_of(merged.token_id).unwrap();
    assert_eq!(parents.len(), 2);
    assert_eq!(parents[0].ordinal, 0);
    assert_eq!(parents[1].ordinal, 1);
    let parent_branches: Vec<Option<String>> = parents.iter()
                                                      .map(|p| landscape.token(p.parent_token_id).unwrap().branch_name)
                                                      .collect();
    assert!(parent_branches.contains(&Some("a".to_string())));
    assert!(parent_branches.contains(&Some("b".to_string())));
}

#[test]
fn require_all_coalesce_with_missing_branch_fails_instead_of_hanging() {
    // El branch "b" no tiene productor; al agotarse el trabajo la
    // barrera cierra con fallo de timeout, nunca un hang.
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("seed", NodeKind::Source)).unwrap();
    graph.add_node(node("splitter", NodeKind::Gate)).unwrap();
    graph.add_node(node("join", NodeKind::Coalesce)).unwrap();
    graph.add_node(node("out", NodeKind::Sink)).unwrap();
    graph.add_edge(move_edge("seed", "splitter", "continue")).unwrap();
    graph.add_edge(GraphEdge::new("splitter", "join", "a", EdgeMode::Copy)).unwrap();
    graph.add_edge(move_edge("join", "out", "continue")).unwrap();

    let (_captured, sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("splitter".to_string(),
                     condition_gate(json!({"name": "splitter",
                                           "condition": "true",
                                           "fork_to": ["a"]})));
    executors.insert("join".to_string(),
                     NodeExecutor::Coalesce { policy: CoalescePolicy { branches: vec!["a".to_string(),
                                                                                     "b".to_string()],
                                                                       strategy: CoalesceStrategy::RequireAll,
                                                                       timeout: Duration::from_millis(100) } });
    executors.insert("out".to_string(), sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let report = run_pipeline(graph, executors, vec![json!({"id": 1})], "seed", "out",
                              Arc::clone(&landscape)).expect("run ok");

    assert_eq!(report.failed, 1, "the arrived branch fails by timeout");
    let outcomes = landscape.outcomes_for_run(report.run_id).unwrap();
    let failed: Vec<_> = outcomes.iter().filter(|o| o.outcome == TokenOutcomeKind::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error_hash.is_some());
}

#[test]
fn aggregation_count_trigger_flushes_batch() {
    // Tres filas con trigger count=3: un batch, miembros CONSUMED_IN_BATCH,
    // un token de salida parentado a los tres.
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("seed", NodeKind::Source)).unwrap();
    graph.add_node(node("stats", NodeKind::Aggregation)).unwrap();
    graph.add_node(node("out", NodeKind::Sink)).unwrap();
    graph.add_edge(move_edge("seed", "stats", "continue")).unwrap();
    graph.add_edge(move_edge("stats", "out", "continue")).unwrap();

    let (captured, sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("stats".to_string(),
                     NodeExecutor::Aggregation { plugin: Box::new(BatchStatsTransform::new())
                                                         as Box<dyn TransformPlugin>,
                                                 trigger: Trigger { count: Some(3),
                                                                    size_bytes: None,
                                                                    interval: None } });
    executors.insert("out".to_string(), sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let rows = vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})];
    let report = run_pipeline(graph, executors, rows, "seed", "out", Arc::clone(&landscape)).expect("run ok");

    assert_eq!(report.consumed_in_batch, 3);
    assert_eq!(report.completed, 1, "the batch output token reaches the sink");

    let written = captured.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].get("batch_count"), Some(&json!(3)));

    let outcomes = landscape.outcomes_for_run(report.run_id).unwrap();
    let consumed: Vec<_> = outcomes.iter()
                                   .filter(|o| o.outcome == TokenOutcomeKind::ConsumedInBatch)
                                   .collect();
    assert_eq!(consumed.len(), 3);
    let batch_id = consumed[0].batch_id.expect("batch id recorded");
    assert!(consumed.iter().all(|o| o.batch_id == Some(batch_id)));

    // BUFFERED previo (no terminal) convive con el terminal: índice parcial.
    for outcome in &consumed {
        let all = landscape.outcomes_for_token(outcome.token_id).unwrap();
        assert!(all.iter().any(|o| o.outcome == TokenOutcomeKind::Buffered && !o.is_terminal));
    }

    let output = outcomes.iter().find(|o| o.outcome == TokenOutcomeKind::Completed).unwrap();
    let parents = landscape.parents_of(output.token_id).unwrap();
    assert_eq!(parents.len(), 3);

    let members = landscape.batch_members(batch_id).unwrap();
    assert_eq!(members.len(), 3);
}

#[test]
fn idempotent_sink_deduplicates_redelivered_rows() {
    // Dos filas de contenido idéntico; el sink idempotente registra un
    // solo efecto observable, aunque ambas completan.
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("seed", NodeKind::Source)).unwrap();
    graph.add_node(node("out", NodeKind::Sink)).unwrap();
    graph.add_edge(move_edge("seed", "out", "continue")).unwrap();

    let (captured, sink) = memory_sink(true);
    let mut executors = HashMap::new();
    executors.insert("out".to_string(), sink);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let rows = vec![json!({"id": 7}), json!({"id": 7})];
    let report = run_pipeline(graph, executors, rows, "seed", "out", Arc::clone(&landscape)).expect("run ok");

    assert_eq!(report.completed, 2);
    assert_eq!(captured.lock().unwrap().len(), 1, "one observable effect");
}

#[test]
fn quarantined_rows_make_the_run_partial() {
    // Fila que no cumple el esquema de la fuente con on_validation_failure
    // discard: QUARANTINED y el run queda parcial.
    use elspeth_adapters::StaticSource;
    use elspeth_core::config::ExecutionSettings;
    use elspeth_core::graph::BuiltPipeline;
    use elspeth_core::plugin::ErrorDisposition as Disposition;
    use elspeth_core::schema::{FieldDef, FieldType, Schema};
    use elspeth_core::{InMemoryPayloadStore, Orchestrator};

    let mut graph = ExecutionGraph::new();
    graph.add_node(node("seed", NodeKind::Source)).unwrap();
    graph.add_node(node("out", NodeKind::Sink)).unwrap();
    graph.add_edge(move_edge("seed", "out", "continue")).unwrap();

    let (captured, sink) = memory_sink(false);
    let mut executors = HashMap::new();
    executors.insert("out".to_string(), sink);

    let schema = Schema::strict(vec![FieldDef::required("id", FieldType::Int)]);
    let source = StaticSource::new(vec![json!({"id": 1}), json!({"name": "no id"})])
        .with_schema(schema)
        .with_validation_failure(Disposition::Discard);

    let landscape: Arc<dyn Landscape> = Arc::new(InMemoryLandscape::new());
    let pipeline = BuiltPipeline { graph,
                                   executors,
                                   source: Box::new(source),
                                   source_node_id: "seed".to_string(),
                                   default_sink: "out".to_string() };
    let orchestrator = Orchestrator::new(pipeline,
                                         Arc::clone(&landscape),
                                         Arc::new(InMemoryPayloadStore::new()),
                                         ExecutionSettings { workers: 1, ..Default::default() },
                                         "fp".to_string());
    let report = orchestrator.run().expect("run ok");

    assert_eq!(report.completed, 1);
    assert_eq!(report.quarantined, 1);
    assert!(report.is_partial());
    assert_eq!(captured.lock().unwrap().len(), 1);

    let outcomes = landscape.outcomes_for_run(report.run_id).unwrap();
    let quarantined: Vec<_> = outcomes.iter()
                                      .filter(|o| o.outcome == TokenOutcomeKind::Quarantined)
                                      .collect();
    assert_eq!(quarantined.len(), 1);
    assert!(quarantined[0].error_hash.is_some());
}
