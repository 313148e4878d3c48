//! elspeth-adapters: plugins de referencia para el engine.
//!
//! Implementaciones concretas del contrato de capacidades, usadas por los
//! tests de integración y por la CLI: fuentes estáticas/JSONL, transforms
//! deterministas de prueba, el gate de condición config-driven y sinks de
//! memoria/JSONL. Ningún adapter toca el landscape directamente; todo pasa
//! por el contrato.

pub mod gates;
pub mod registry;
pub mod sinks;
pub mod sources;
pub mod transforms;

pub use gates::ConditionGate;
pub use registry::builtin_registry;
pub use sinks::{JsonlSink, MemorySink, NullSink};
pub use sources::{JsonlSource, StaticSource};
pub use transforms::{BatchStatsTransform, FlakyTransform, PassthroughTransform, SetFieldsTransform, SplitTransform};

use elspeth_core::errors::ConfigError;
use elspeth_core::schema::Schema;
use serde_json::Value;

/// Esquema declarado en las opciones del plugin (`{"schema": {"fields":
/// [...]}}`); sin declaración el plugin es dinámico/observado.
pub(crate) fn schema_from_options(options: &Value) -> Result<Schema, ConfigError> {
    match options.get("schema") {
        None | Some(Value::Null) => Ok(Schema::Dynamic),
        Some(decl) => serde_json::from_value(decl.clone())
            .map(|fields: SchemaDecl| Schema::strict(fields.fields))
            .map_err(|e| ConfigError::Invalid(format!("invalid schema declaration: {e}"))),
    }
}

#[derive(serde::Deserialize)]
pub(crate) struct SchemaDecl {
    pub fields: Vec<elspeth_core::schema::FieldDef>,
}
