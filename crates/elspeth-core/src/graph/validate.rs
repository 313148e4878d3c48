//! Validación estructural y de esquemas del grafo construido.
//!
//! Reglas:
//! - Aciclicidad (Kahn).
//! - Todo sink alcanzable desde el source (los DIVERT cuentan: existen
//!   justamente para dar alcanzabilidad auditable a sinks de error).
//! - Todo edge no-DIVERT: `produces(from) ⊇ requires(to)`; el fallo cita
//!   productor, consumidor y campos faltantes.
//! - Coalesce con ≥2 productores tipados: compatibilidad por pares.
//! - Gate con múltiples entrantes: los productores deben coincidir (el gate
//!   es pass-through).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::errors::ConfigError;
use crate::schema::missing_required_fields;

use super::{EdgeMode, ExecutionGraph, NodeKind};

pub fn validate(graph: &ExecutionGraph) -> Result<(), ConfigError> {
    check_acyclic(graph)?;
    check_sink_reachability(graph)?;
    check_edge_schemas(graph)?;
    check_join_inputs(graph)?;
    Ok(())
}

fn check_acyclic(graph: &ExecutionGraph) -> Result<(), ConfigError> {
    let mut indegree: HashMap<&str, usize> = graph.nodes().map(|n| (n.id.as_str(), 0)).collect();
    for edge in graph.edges() {
        *indegree.entry(edge.to.as_str()).or_insert(0) += 1;
    }
    let mut queue: VecDeque<&str> = indegree.iter()
                                            .filter(|(_, d)| **d == 0)
                                            .map(|(id, _)| *id)
                                            .collect();
    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for edge in graph.edges_from(id) {
            let d = indegree.get_mut(edge.to.as_str()).expect("edge endpoints checked on insert");
            *d -= 1;
            if *d == 0 {
                queue.push_back(edge.to.as_str());
            }
        }
    }
    if visited != graph.nodes().count() {
        // Algún nodo quedó con indegree > 0: está en un ciclo.
        let in_cycle = indegree.iter()
                               .find(|(_, d)| **d > 0)
                               .map(|(id, _)| id.to_string())
                               .unwrap_or_default();
        return Err(ConfigError::Cycle(in_cycle));
    }
    Ok(())
}

fn check_sink_reachability(graph: &ExecutionGraph) -> Result<(), ConfigError> {
    let source = match graph.source_node() {
        Some(s) => s,
        None => return Err(ConfigError::Invalid("graph has no source node".to_string())),
    };
    let mut reached: HashSet<&str> = HashSet::new();
    let mut frontier = vec![source.id.as_str()];
    while let Some(id) = frontier.pop() {
        if !reached.insert(id) {
            continue;
        }
        for edge in graph.edges_from(id) {
            frontier.push(edge.to.as_str());
        }
    }
    for sink in graph.sink_nodes() {
        if !reached.contains(sink.id.as_str()) {
            return Err(ConfigError::UnreachableSink(sink.id.clone()));
        }
    }
    Ok(())
}

fn check_edge_schemas(graph: &ExecutionGraph) -> Result<(), ConfigError> {
    for edge in graph.edges() {
        if edge.mode == EdgeMode::Divert {
            continue;
        }
        let from = graph.node(&edge.from).expect("edge endpoints checked on insert");
        let to = graph.node(&edge.to).expect("edge endpoints checked on insert");
        let missing = missing_required_fields(&from.produces(), &to.requires());
        if !missing.is_empty() {
            return Err(ConfigError::IncompatibleEdge { producer: from.id.clone(),
                                                       consumer: to.id.clone(),
                                                       missing: missing.join(", ") });
        }
    }
    Ok(())
}

fn check_join_inputs(graph: &ExecutionGraph) -> Result<(), ConfigError> {
    for node in graph.nodes() {
        let incoming = graph.edges_into(&node.id);
        if incoming.len() < 2 {
            continue;
        }
        // Productores tipados entrantes (los dinámicos no restringen).
        let producers: Vec<_> = incoming.iter()
                                        .filter(|e| e.mode != EdgeMode::Divert)
                                        .filter_map(|e| graph.node(&e.from))
                                        .filter(|p| p.output_schema.is_some())
                                        .collect();
        for i in 0..producers.len() {
            for j in (i + 1)..producers.len() {
                let (left, right) = (producers[i], producers[j]);
                let ltr = missing_required_fields(&left.produces(), &right.produces());
                let rtl = missing_required_fields(&right.produces(), &left.produces());
                if ltr.is_empty() && rtl.is_empty() {
                    continue;
                }
                match node.kind {
                    NodeKind::Coalesce => {
                        let mut missing = ltr;
                        missing.extend(rtl);
                        missing.sort();
                        missing.dedup();
                        return Err(ConfigError::IncompatibleCoalesceInputs { node: node.id.clone(),
                                                                             left: left.id.clone(),
                                                                             right: right.id.clone(),
                                                                             missing: missing.join(", ") });
                    }
                    NodeKind::Gate => {
                        return Err(ConfigError::GateProducersDisagree { node: node.id.clone(),
                                                                        left: left.id.clone(),
                                                                        right: right.id.clone() });
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
