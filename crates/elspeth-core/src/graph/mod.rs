//! Grafo de ejecución tipado (C3).
//!
//! DAG de nodos (source, transform, aggregation, gate, coalesce, sink) y
//! edges etiquetados con modo (MOVE / COPY / DIVERT). La estructura se
//! valida al construir: aciclicidad, alcanzabilidad de sinks, existencia de
//! targets y compatibilidad de esquemas por edge (una sola función,
//! `schema::missing_required_fields`, sin atajos por plugin).

pub mod builder;
pub mod edge;
pub mod node;
pub mod validate;

pub use builder::{BuiltPipeline, CoalescePolicy, CoalesceStrategy, NodeExecutor, PipelineBuilder, Trigger};
pub use edge::{EdgeMode, GraphEdge};
pub use node::{GraphNode, NodeKind};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::constants::is_reserved_label;
use crate::errors::ConfigError;

/// Grafo inmutable tras la construcción. La iteración de nodos es estable
/// (orden de inserción) para que la serialización sea determinista.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
    nodes: IndexMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
}

/// Forma serializable del grafo (round-trip estable: mismo conjunto de
/// nodos, edges y etiquetas al reconstruir).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDescription {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: GraphNode) -> Result<(), ConfigError> {
        if self.nodes.contains_key(&node.id) {
            return Err(ConfigError::DuplicateNode(node.id));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Agrega un edge. Ambos endpoints deben existir; las etiquetas con
    /// prefijo reservado sólo se admiten en edges DIVERT (son del sistema).
    pub fn add_edge(&mut self, edge: GraphEdge) -> Result<(), ConfigError> {
        if !self.nodes.contains_key(&edge.from) {
            return Err(ConfigError::UnknownNode(edge.from));
        }
        if !self.nodes.contains_key(&edge.to) {
            return Err(ConfigError::UnknownNode(edge.to));
        }
        if edge.mode != EdgeMode::Divert && is_reserved_label(&edge.label) {
            return Err(ConfigError::ReservedLabel(edge.label));
        }
        self.edges.push(edge);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn edges_from(&self, id: &str) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }

    pub fn edges_into(&self, id: &str) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|e| e.to == id).collect()
    }

    /// Edge de continuación secuencial saliente (MOVE con label "continue").
    pub fn continue_edge(&self, id: &str) -> Option<&GraphEdge> {
        self.edges
            .iter()
            .find(|e| e.from == id && e.mode == EdgeMode::Move && e.label == crate::constants::CONTINUE_LABEL)
    }

    /// Edge saliente con una etiqueta concreta.
    pub fn edge_labelled(&self, id: &str, label: &str) -> Option<&GraphEdge> {
        self.edges.iter().find(|e| e.from == id && e.label == label)
    }

    /// Edges COPY salientes (branches de fork), en orden de declaración.
    pub fn copy_edges(&self, id: &str) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|e| e.from == id && e.mode == EdgeMode::Copy).collect()
    }

    /// Edge DIVERT saliente hacia el sink dado.
    pub fn divert_edge_to(&self, id: &str, sink: &str) -> Option<&GraphEdge> {
        self.edges
            .iter()
            .find(|e| e.from == id && e.mode == EdgeMode::Divert && e.to == sink)
    }

    pub fn source_node(&self) -> Option<&GraphNode> {
        self.nodes.values().find(|n| n.kind == NodeKind::Source)
    }

    pub fn sink_nodes(&self) -> Vec<&GraphNode> {
        self.nodes.values().filter(|n| n.kind == NodeKind::Sink).collect()
    }

    pub fn to_description(&self) -> GraphDescription {
        GraphDescription { nodes: self.nodes.values().cloned().collect(),
                           edges: self.edges.clone() }
    }

    pub fn from_description(description: GraphDescription) -> Result<Self, ConfigError> {
        let mut graph = ExecutionGraph::new();
        for node in description.nodes {
            graph.add_node(node)?;
        }
        for edge in description.edges {
            graph.add_edge(edge)?;
        }
        Ok(graph)
    }
}
