//! Nodos tipados del grafo de ejecución.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::Schema;

/// Variantes de nodo del DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Source,
    Transform,
    Aggregation,
    Gate,
    Coalesce,
    Sink,
}

/// Nodo del grafo: identidad del plugin, snapshot de configuración y
/// referencias de esquema (None = dinámico).
///
/// Las aggregations tienen input y output distintos por diseño: consumen
/// filas individuales y emiten el resumen del batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub plugin_name: String,
    /// Snapshot de opciones con el que se instanció el plugin.
    pub config: Value,
    pub input_schema: Option<Schema>,
    pub output_schema: Option<Schema>,
}

impl GraphNode {
    /// Esquema de salida efectivo (dinámico si no hay declaración).
    pub fn produces(&self) -> Schema {
        self.output_schema.clone().unwrap_or(Schema::Dynamic)
    }

    /// Esquema de entrada efectivo.
    pub fn requires(&self) -> Schema {
        self.input_schema.clone().unwrap_or(Schema::Dynamic)
    }
}
