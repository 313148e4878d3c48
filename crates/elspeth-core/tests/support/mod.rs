//! Helpers compartidos por los tests de integración del core.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use elspeth_adapters::{MemorySink, StaticSource};
use elspeth_core::config::ExecutionSettings;
use elspeth_core::graph::{BuiltPipeline, EdgeMode, ExecutionGraph, GraphEdge, GraphNode, NodeExecutor, NodeKind};
use elspeth_core::landscape::Landscape;
use elspeth_core::orchestrator::{Orchestrator, RunReport};
use elspeth_core::plugin::SinkPlugin;
use elspeth_core::{EngineError, InMemoryPayloadStore};

/// Nodo simple sin esquemas declarados (dinámico).
pub fn node(id: &str, kind: NodeKind) -> GraphNode {
    GraphNode { id: id.to_string(),
                kind,
                plugin_name: id.to_string(),
                config: Value::Null,
                input_schema: None,
                output_schema: None }
}

pub fn move_edge(from: &str, to: &str, label: &str) -> GraphEdge {
    GraphEdge::new(from, to, label, EdgeMode::Move)
}

/// Sink de memoria con captura compartida más su ejecutor.
pub fn memory_sink(idempotent: bool) -> (Arc<Mutex<Vec<Value>>>, NodeExecutor) {
    let mut sink = MemorySink::new();
    if idempotent {
        sink = sink.idempotent();
    }
    let capture = sink.capture_handle();
    let executor = NodeExecutor::Sink { plugin: Mutex::new(Box::new(sink) as Box<dyn SinkPlugin>),
                                        idempotent };
    (capture, executor)
}

/// Ejecuta un pipeline armado a mano con el backend in-memory. Un solo
/// worker: los tests de orden por fila lo necesitan determinista.
pub fn run_pipeline(graph: ExecutionGraph,
                    executors: HashMap<String, NodeExecutor>,
                    rows: Vec<Value>,
                    source_node_id: &str,
                    default_sink: &str,
                    landscape: Arc<dyn Landscape>)
                    -> Result<RunReport, EngineError> {
    let pipeline = BuiltPipeline { graph,
                                   executors,
                                   source: Box::new(StaticSource::new(rows)),
                                   source_node_id: source_node_id.to_string(),
                                   default_sink: default_sink.to_string() };
    let settings = ExecutionSettings { workers: 1, ..Default::default() };
    let orchestrator = Orchestrator::new(pipeline,
                                         landscape,
                                         Arc::new(InMemoryPayloadStore::new()),
                                         settings,
                                         "test-fingerprint".to_string());
    orchestrator.run()
}
