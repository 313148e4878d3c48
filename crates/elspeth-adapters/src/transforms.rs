//! Transforms de referencia, deterministas salvo que se indique.

use std::sync::Mutex;

use elspeth_core::errors::ConfigError;
use elspeth_core::plugin::{Determinism, ErrorDisposition, PluginContext, PluginError, PluginErrorKind, SuccessReason,
                           TransformErrorReason, TransformPlugin, TransformResult};
use elspeth_core::schema::Schema;
use serde_json::{json, Value};

use crate::schema_from_options;

/// No-op: la fila sale igual que entró.
pub struct PassthroughTransform {
    name: String,
    schema: Schema,
}

impl PassthroughTransform {
    pub fn new() -> Self {
        Self { name: "passthrough".to_string(), schema: Schema::Dynamic }
    }

    pub fn from_options(options: &Value) -> Result<Box<dyn TransformPlugin>, ConfigError> {
        let schema = schema_from_options(options)?;
        Ok(Box::new(Self { name: "passthrough".to_string(), schema }))
    }
}

impl Default for PassthroughTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformPlugin for PassthroughTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Schema {
        &self.schema
    }

    fn output_schema(&self) -> &Schema {
        &self.schema
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn process(&self, row: Value, _ctx: &PluginContext) -> TransformResult {
        TransformResult::Success { row, reason: Some(SuccessReason::action("passthrough")) }
    }
}

/// Agrega campos fijos declarados en opciones. Declara `fields_added`, con
/// lo que el procesador detecta colisiones con campos existentes.
pub struct SetFieldsTransform {
    name: String,
    fields: serde_json::Map<String, Value>,
    schema: Schema,
}

impl SetFieldsTransform {
    pub fn new(fields: serde_json::Map<String, Value>) -> Self {
        Self { name: "set_fields".to_string(),
               fields,
               schema: Schema::Dynamic }
    }

    pub fn from_options(options: &Value) -> Result<Box<dyn TransformPlugin>, ConfigError> {
        let fields = options.get("fields")
                            .and_then(|f| f.as_object())
                            .cloned()
                            .ok_or_else(|| ConfigError::Invalid("set_fields requires 'fields' object".to_string()))?;
        let schema = schema_from_options(options)?;
        Ok(Box::new(Self { name: "set_fields".to_string(), fields, schema }))
    }
}

impl TransformPlugin for SetFieldsTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Schema {
        &self.schema
    }

    fn output_schema(&self) -> &Schema {
        &Schema::Dynamic
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn process(&self, row: Value, _ctx: &PluginContext) -> TransformResult {
        let mut obj = match row {
            Value::Object(obj) => obj,
            other => {
                return TransformResult::Error(TransformErrorReason::plugin(&PluginError::new(
                    PluginErrorKind::InvalidInput,
                    format!("expected object row, got {other}"),
                )))
            }
        };
        let added: Vec<String> = self.fields.keys().cloned().collect();
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.clone());
        }
        let reason = SuccessReason { action: "set_fields".to_string(),
                                     fields_added: added,
                                     ..Default::default() };
        TransformResult::Success { row: Value::Object(obj), reason: Some(reason) }
    }
}

/// Divide un campo array en una fila por elemento (`success_multi` →
/// expand). El resto de la fila se copia en cada hija.
pub struct SplitTransform {
    name: String,
    field: String,
    schema: Schema,
}

impl SplitTransform {
    pub fn new(field: &str) -> Self {
        Self { name: "split".to_string(),
               field: field.to_string(),
               schema: Schema::Dynamic }
    }

    pub fn from_options(options: &Value) -> Result<Box<dyn TransformPlugin>, ConfigError> {
        let field = options.get("field")
                           .and_then(|f| f.as_str())
                           .ok_or_else(|| ConfigError::Invalid("split requires 'field'".to_string()))?
                           .to_string();
        let schema = schema_from_options(options)?;
        Ok(Box::new(Self { name: "split".to_string(), field, schema }))
    }
}

impl TransformPlugin for SplitTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Schema {
        &self.schema
    }

    fn output_schema(&self) -> &Schema {
        &Schema::Dynamic
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn process(&self, row: Value, _ctx: &PluginContext) -> TransformResult {
        let obj = match row.as_object() {
            Some(obj) => obj,
            None => {
                return TransformResult::Error(TransformErrorReason::plugin(&PluginError::new(
                    PluginErrorKind::InvalidInput,
                    "expected object row",
                )))
            }
        };
        let items = match obj.get(&self.field).and_then(|v| v.as_array()) {
            Some(items) => items.clone(),
            None => {
                return TransformResult::Error(TransformErrorReason::plugin(&PluginError::new(
                    PluginErrorKind::InvalidInput,
                    format!("field '{}' is not an array", self.field),
                )))
            }
        };
        let rows: Vec<Value> = items.into_iter()
                                    .map(|item| {
                                        let mut child = obj.clone();
                                        child.insert(self.field.clone(), item);
                                        Value::Object(child)
                                    })
                                    .collect();
        TransformResult::SuccessMulti { rows, reason: Some(SuccessReason::action("split")) }
    }
}

/// Transform de prueba que falla según un guion: una lista de kinds de error
/// consumida en orden; agotada la lista, la fila pasa. `io_dependent` por el
/// estado interno.
pub struct FlakyTransform {
    name: String,
    script: Mutex<Vec<PluginErrorKind>>,
    schema: Schema,
}

impl FlakyTransform {
    pub fn new(script: Vec<PluginErrorKind>) -> Self {
        Self { name: "flaky".to_string(),
               script: Mutex::new(script),
               schema: Schema::Dynamic }
    }

    pub fn from_options(options: &Value) -> Result<Box<dyn TransformPlugin>, ConfigError> {
        let script: Vec<PluginErrorKind> = options.get("errors")
                                                  .map(|e| serde_json::from_value(e.clone()))
                                                  .transpose()
                                                  .map_err(|e| ConfigError::Invalid(format!("invalid errors: {e}")))?
                                                  .unwrap_or_default();
        Ok(Box::new(Self { name: "flaky".to_string(),
                           script: Mutex::new(script),
                           schema: Schema::Dynamic }))
    }
}

impl TransformPlugin for FlakyTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Schema {
        &self.schema
    }

    fn output_schema(&self) -> &Schema {
        &self.schema
    }

    fn determinism(&self) -> Determinism {
        Determinism::IoDependent
    }

    fn on_error(&self) -> Option<&ErrorDisposition> {
        None
    }

    fn process(&self, row: Value, _ctx: &PluginContext) -> TransformResult {
        let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        if script.is_empty() {
            return TransformResult::success(row);
        }
        let kind = script.remove(0);
        TransformResult::Error(TransformErrorReason::plugin(&PluginError::new(kind, "scripted failure")))
    }
}

/// Aggregation de referencia: recibe la fila resumen del batch
/// (`{"rows": [...], "count": n}`) y emite estadísticas del batch.
pub struct BatchStatsTransform {
    name: String,
    input_schema: Schema,
    output_schema: Schema,
}

impl BatchStatsTransform {
    pub fn new() -> Self {
        Self { name: "batch_stats".to_string(),
               input_schema: Schema::Dynamic,
               output_schema: Schema::Dynamic }
    }

    pub fn from_options(_options: &Value) -> Result<Box<dyn TransformPlugin>, ConfigError> {
        Ok(Box::new(Self::new()))
    }
}

impl Default for BatchStatsTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformPlugin for BatchStatsTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn process(&self, row: Value, _ctx: &PluginContext) -> TransformResult {
        let count = row.get("count").and_then(|c| c.as_u64()).unwrap_or(0);
        let rows = row.get("rows").and_then(|r| r.as_array()).cloned().unwrap_or_default();
        let summary = json!({
            "batch_count": count,
            "batch_bytes": rows.iter().map(|r| r.to_string().len()).sum::<usize>(),
        });
        TransformResult::Success { row: summary, reason: Some(SuccessReason::action("batch_stats")) }
    }
}
