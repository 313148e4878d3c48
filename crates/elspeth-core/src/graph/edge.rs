//! Edges etiquetados y con modo.
//!
//! Entre el mismo par de nodos puede haber edges paralelos; se distinguen
//! por `label`. El modo gobierna la semántica de flujo:
//! - MOVE: el token continúa por exactamente este edge.
//! - COPY: en un gate de fork se crea un hijo fresco por edge COPY.
//! - DIVERT: edge estructural hacia un sink de cuarentena/error. No
//!   participa del flujo normal; da alcanzabilidad y un node_id auditable al
//!   sink, y se omite en la validación de esquemas porque el payload
//!   desviado no tiene por qué cumplir el esquema del productor.

use serde::{Deserialize, Serialize};

use crate::landscape::RoutingMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EdgeMode {
    Move,
    Copy,
    Divert,
}

impl EdgeMode {
    pub fn routing_mode(self) -> RoutingMode {
        match self {
            EdgeMode::Move => RoutingMode::Move,
            EdgeMode::Copy => RoutingMode::Copy,
            EdgeMode::Divert => RoutingMode::Divert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub label: String,
    pub mode: EdgeMode,
}

impl GraphEdge {
    pub fn new(from: &str, to: &str, label: &str, mode: EdgeMode) -> Self {
        Self { id: format!("{from}->{to}#{label}"),
               from: from.to_string(),
               to: to.to_string(),
               label: label.to_string(),
               mode }
    }
}
