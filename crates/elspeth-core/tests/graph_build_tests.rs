//! Construcción y validación del grafo desde settings.

use serde_json::json;

use elspeth_adapters::builtin_registry;
use elspeth_core::config::PipelineSettings;
use elspeth_core::errors::ConfigError;
use elspeth_core::graph::{validate, EdgeMode, ExecutionGraph, GraphEdge, GraphNode, NodeKind, PipelineBuilder};
use elspeth_core::schema::{FieldDef, FieldType, Schema};

fn settings_from_yaml_like(value: serde_json::Value) -> PipelineSettings {
    serde_json::from_value(value).expect("valid settings shape")
}

fn base_settings() -> serde_json::Value {
    json!({
        "source": {"plugin": "static", "options": {"rows": [{"id": 1}]}},
        "sinks": {"out": {"plugin": "null", "options": {}}},
        "default_sink": "out"
    })
}

#[test]
fn minimal_pipeline_builds_and_validates() {
    let settings = settings_from_yaml_like(base_settings());
    let registry = builtin_registry();
    let pipeline = PipelineBuilder::from_settings(&settings, &registry).expect("builds");

    assert_eq!(pipeline.graph.nodes().count(), 2);
    assert!(pipeline.graph.continue_edge("static").is_some());
}

#[test]
fn incompatible_edge_names_producer_consumer_and_missing_fields() {
    // El transform produce {a:int}; el sink requiere {a:int, b:str}.
    let mut value = base_settings();
    value["transforms"] = json!([{
        "plugin": "passthrough",
        "options": {"schema": {"fields": [{"name": "a", "type": "int"}]}}
    }]);
    value["sinks"]["out"]["options"] = json!({
        "schema": {"fields": [{"name": "a", "type": "int"}, {"name": "b", "type": "str"}]}
    });
    let settings = settings_from_yaml_like(value);
    let registry = builtin_registry();

    let err = PipelineBuilder::from_settings(&settings, &registry).unwrap_err();
    match err {
        ConfigError::IncompatibleEdge { producer, consumer, missing } => {
            assert_eq!(producer, "passthrough");
            assert_eq!(consumer, "out");
            assert_eq!(missing, "b");
        }
        other => panic!("expected IncompatibleEdge, got {other:?}"),
    }
}

#[test]
fn unknown_fork_branch_lists_available_targets() {
    // Un fork_to que no calza con branch de coalesce ni sink falla
    // nombrando los candidatos.
    let mut value = base_settings();
    value["gates"] = json!([{
        "name": "splitter",
        "condition": "true",
        "fork_to": ["missing_branch"]
    }]);
    value["coalesce"] = json!([{
        "name": "join",
        "branches": ["a", "b"]
    }]);
    let settings = settings_from_yaml_like(value);
    let registry = builtin_registry();

    let err = PipelineBuilder::from_settings(&settings, &registry).unwrap_err();
    match err {
        ConfigError::UnknownForkBranch { gate, branch, available } => {
            assert_eq!(gate, "splitter");
            assert_eq!(branch, "missing_branch");
            assert!(available.contains('a') && available.contains('b') && available.contains("out"),
                    "candidates listed: {available}");
        }
        other => panic!("expected UnknownForkBranch, got {other:?}"),
    }
}

#[test]
fn reserved_route_labels_are_rejected_at_parse() {
    let mut value = base_settings();
    value["gates"] = json!([{
        "name": "g",
        "condition": "true",
        "routes": {"__quarantine__": "out"}
    }]);
    let settings = settings_from_yaml_like(value);
    assert!(matches!(settings.validate(), Err(ConfigError::ReservedLabel(_))));
}

#[test]
fn unknown_route_target_is_rejected() {
    let mut value = base_settings();
    value["gates"] = json!([{
        "name": "g",
        "condition": "true",
        "routes": {"flag": "nonexistent_sink"}
    }]);
    let settings = settings_from_yaml_like(value);
    assert!(matches!(settings.validate(), Err(ConfigError::UnknownRouteTarget { .. })));
}

#[test]
fn divert_edges_skip_schema_compatibility() {
    // El sink de cuarentena exige un esquema que el productor no cumple; el
    // edge DIVERT no valida esquema y el grafo construye igual.
    let mut value = base_settings();
    value["source"]["options"]["on_validation_failure"] = json!("quarantine");
    value["source"]["on_validation_failure"] = json!("quarantine");
    value["sinks"]["quarantine"] = json!({
        "plugin": "memory",
        "options": {"schema": {"fields": [{"name": "impossible", "type": "str"}]}}
    });
    let settings = settings_from_yaml_like(value);
    let registry = builtin_registry();

    let pipeline = PipelineBuilder::from_settings(&settings, &registry).expect("divert edges skip schema checks");
    let divert = pipeline.graph
                         .divert_edge_to("static", "quarantine")
                         .expect("divert edge present");
    assert_eq!(divert.mode, EdgeMode::Divert);
    assert_eq!(divert.label, "__quarantine__");
}

#[test]
fn cycles_are_detected() {
    let mut graph = ExecutionGraph::new();
    for (id, kind) in [("src", NodeKind::Source), ("a", NodeKind::Transform), ("b", NodeKind::Transform),
                       ("out", NodeKind::Sink)]
    {
        graph.add_node(GraphNode { id: id.to_string(),
                                   kind,
                                   plugin_name: id.to_string(),
                                   config: json!(null),
                                   input_schema: None,
                                   output_schema: None })
             .unwrap();
    }
    graph.add_edge(GraphEdge::new("src", "a", "continue", EdgeMode::Move)).unwrap();
    graph.add_edge(GraphEdge::new("a", "b", "continue", EdgeMode::Move)).unwrap();
    graph.add_edge(GraphEdge::new("b", "a", "back", EdgeMode::Move)).unwrap();
    graph.add_edge(GraphEdge::new("b", "out", "done", EdgeMode::Move)).unwrap();

    assert!(matches!(validate::validate(&graph), Err(ConfigError::Cycle(_))));
}

#[test]
fn unreachable_sinks_are_detected() {
    let mut graph = ExecutionGraph::new();
    for (id, kind) in [("src", NodeKind::Source), ("out", NodeKind::Sink), ("island", NodeKind::Sink)] {
        graph.add_node(GraphNode { id: id.to_string(),
                                   kind,
                                   plugin_name: id.to_string(),
                                   config: json!(null),
                                   input_schema: None,
                                   output_schema: None })
             .unwrap();
    }
    graph.add_edge(GraphEdge::new("src", "out", "continue", EdgeMode::Move)).unwrap();

    assert!(matches!(validate::validate(&graph), Err(ConfigError::UnreachableSink(sink)) if sink == "island"));
}

#[test]
fn gate_with_disagreeing_producers_is_rejected() {
    let int_schema = Schema::strict(vec![FieldDef::required("x", FieldType::Int)]);
    let str_schema = Schema::strict(vec![FieldDef::required("y", FieldType::Str)]);

    let mut graph = ExecutionGraph::new();
    graph.add_node(GraphNode { id: "src".to_string(),
                               kind: NodeKind::Source,
                               plugin_name: "src".to_string(),
                               config: json!(null),
                               input_schema: None,
                               output_schema: Some(int_schema.clone()) })
         .unwrap();
    graph.add_node(GraphNode { id: "other".to_string(),
                               kind: NodeKind::Transform,
                               plugin_name: "other".to_string(),
                               config: json!(null),
                               input_schema: None,
                               output_schema: Some(str_schema) })
         .unwrap();
    graph.add_node(GraphNode { id: "gate".to_string(),
                               kind: NodeKind::Gate,
                               plugin_name: "gate".to_string(),
                               config: json!(null),
                               input_schema: None,
                               output_schema: None })
         .unwrap();
    graph.add_node(GraphNode { id: "out".to_string(),
                               kind: NodeKind::Sink,
                               plugin_name: "out".to_string(),
                               config: json!(null),
                               input_schema: None,
                               output_schema: None })
         .unwrap();
    graph.add_edge(GraphEdge::new("src", "gate", "continue", EdgeMode::Move)).unwrap();
    graph.add_edge(GraphEdge::new("src", "other", "alt", EdgeMode::Move)).unwrap();
    graph.add_edge(GraphEdge::new("other", "gate", "continue", EdgeMode::Move)).unwrap();
    graph.add_edge(GraphEdge::new("gate", "out", "continue", EdgeMode::Move)).unwrap();

    assert!(matches!(validate::validate(&graph), Err(ConfigError::GateProducersDisagree { .. })));
}

#[test]
fn graph_description_round_trips() {
    // Serializar y reconstruir da el mismo conjunto de nodos, edges y
    // etiquetas.
    let settings = settings_from_yaml_like({
        let mut value = base_settings();
        value["transforms"] = json!([{"plugin": "passthrough", "options": {}}]);
        value["gates"] = json!([{
            "name": "g",
            "condition": "id > 0",
            "routes": {"flag": "out"}
        }]);
        value
    });
    let registry = builtin_registry();
    let pipeline = PipelineBuilder::from_settings(&settings, &registry).expect("builds");

    let description = pipeline.graph.to_description();
    let serialized = serde_json::to_string(&description).unwrap();
    let deserialized: elspeth_core::graph::GraphDescription = serde_json::from_str(&serialized).unwrap();
    let rebuilt = ExecutionGraph::from_description(deserialized).expect("rebuilds");

    let node_ids: Vec<&str> = pipeline.graph.nodes().map(|n| n.id.as_str()).collect();
    let rebuilt_ids: Vec<&str> = rebuilt.nodes().map(|n| n.id.as_str()).collect();
    assert_eq!(node_ids, rebuilt_ids);
    assert_eq!(pipeline.graph.edges(), rebuilt.edges());
}
