//! Definición de campos tipados.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tipo de un campo. Escalares más `Json` para shapes estructurados (objetos
/// o arrays cuya forma interna no se valida).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    Float,
    Str,
    Bool,
    DateTime,
    Json,
}

impl FieldType {
    /// Relación de subtipos productor → consumidor. Widening numérico es la
    /// única arista no-identidad: un Int producido satisface un Float
    /// requerido.
    pub fn satisfies(self, required: FieldType) -> bool {
        self == required || (self == FieldType::Int && required == FieldType::Float)
    }

    /// `true` si `value` es una representación JSON válida de este tipo.
    pub fn matches_value(self, value: &Value) -> bool {
        match self {
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Str => value.is_string(),
            FieldType::Bool => value.is_boolean(),
            // Fechas viajan como string RFC 3339 dentro de las filas.
            FieldType::DateTime => value.as_str().map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                                        .unwrap_or(false),
            FieldType::Json => value.is_object() || value.is_array(),
        }
    }
}

/// Campo declarado de un esquema estricto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_required() -> bool {
    true
}

impl FieldDef {
    pub fn required(name: &str, ty: FieldType) -> Self {
        Self { name: name.to_string(), ty, required: true, default: None }
    }

    pub fn optional(name: &str, ty: FieldType) -> Self {
        Self { name: name.to_string(), ty, required: false, default: None }
    }
}
