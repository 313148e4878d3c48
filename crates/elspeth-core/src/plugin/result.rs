//! Resultados tipados de la invocación de plugins.
//!
//! El procesador traduce estos resultados a node_states, routing_events y
//! outcomes; los plugins nunca escriben estado terminal por su cuenta.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::FieldError;

use super::error::{PluginError, PluginErrorKind};

/// Razón estructurada de un éxito, capturada en el audit trail
/// (`success_reason_json` del node_state).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuccessReason {
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields_modified: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields_added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields_removed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SuccessReason {
    pub fn action(action: &str) -> Self {
        Self { action: action.to_string(), ..Default::default() }
    }
}

/// Tipo del error dentro de un `TransformErrorReason`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "error_type", content = "kind")]
pub enum ErrorType {
    SchemaValidation,
    FieldCollision,
    Plugin(PluginErrorKind),
}

/// Razón estructurada de un error de transform/validación.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformErrorReason {
    #[serde(flatten)]
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
}

impl TransformErrorReason {
    pub fn schema_validation(field_errors: Vec<FieldError>) -> Self {
        Self { error_type: ErrorType::SchemaValidation,
               message: "row does not satisfy the node input schema".to_string(),
               field_errors }
    }

    pub fn field_collision(fields: Vec<String>) -> Self {
        let field_errors = fields.into_iter()
                                 .map(|f| FieldError { field: f, reason: "would overwrite existing field".to_string() })
                                 .collect();
        Self { error_type: ErrorType::FieldCollision,
               message: "transform would silently overwrite existing fields".to_string(),
               field_errors }
    }

    pub fn plugin(err: &PluginError) -> Self {
        Self { error_type: ErrorType::Plugin(err.kind),
               message: err.message.clone(),
               field_errors: vec![] }
    }

    /// Sólo los errores de plugin con kind transitorio se reintentan.
    pub fn is_retryable(&self) -> bool {
        matches!(self.error_type, ErrorType::Plugin(kind) if kind.is_retryable())
    }
}

/// Resultado neutral de un transform.
#[derive(Debug, Clone)]
pub enum TransformResult {
    Success { row: Value, reason: Option<SuccessReason> },
    SuccessMulti { rows: Vec<Value>, reason: Option<SuccessReason> },
    Error(TransformErrorReason),
}

impl TransformResult {
    pub fn success(row: Value) -> Self {
        TransformResult::Success { row, reason: None }
    }
}

/// Decisión de un gate. Los gates enrutan; nunca modifican la fila.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Continuar por el edge MOVE con esta etiqueta.
    Route(String),
    /// Crear un hijo por cada branch declarado del gate (edges COPY).
    Fork,
}

/// Confirmación de escritura de un sink.
#[derive(Debug, Clone, Default)]
pub struct SinkAck {
    /// `true` si el sink dedujo la fila (sinks idempotentes ante reentrega).
    pub deduplicated: bool,
}

/// Resultado de un poll de source. A lo sumo una fila por llamada; el marcador
/// `Exhausted` cierra la iteración.
#[derive(Debug, Clone)]
pub enum SourcePoll {
    Row(Value),
    Exhausted,
}
