//! Fuentes de referencia.

use std::fs::File;
use std::io::{BufRead, BufReader};

use elspeth_core::errors::ConfigError;
use elspeth_core::plugin::{ErrorDisposition, PluginContext, PluginError, PluginErrorKind, SourcePlugin, SourcePoll};
use elspeth_core::schema::Schema;
use serde_json::Value;

use crate::schema_from_options;

/// Fuente estática: emite las filas declaradas en las opciones, en orden.
/// Útil en tests y pipelines de demostración.
pub struct StaticSource {
    name: String,
    rows: Vec<Value>,
    cursor: usize,
    schema: Schema,
    on_validation_failure: ErrorDisposition,
}

impl StaticSource {
    pub fn new(rows: Vec<Value>) -> Self {
        Self { name: "static".to_string(),
               rows,
               cursor: 0,
               schema: Schema::Dynamic,
               on_validation_failure: ErrorDisposition::Discard }
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_validation_failure(mut self, disposition: ErrorDisposition) -> Self {
        self.on_validation_failure = disposition;
        self
    }

    pub fn from_options(options: &Value) -> Result<Box<dyn SourcePlugin>, ConfigError> {
        let rows = options.get("rows")
                          .and_then(|r| r.as_array())
                          .cloned()
                          .ok_or_else(|| ConfigError::Invalid("static source requires 'rows' array".to_string()))?;
        let schema = schema_from_options(options)?;
        let on_validation_failure = options.get("on_validation_failure")
                                           .and_then(|v| v.as_str())
                                           .map(ErrorDisposition::from_config)
                                           .unwrap_or(ErrorDisposition::Discard);
        Ok(Box::new(StaticSource { name: "static".to_string(),
                                   rows,
                                   cursor: 0,
                                   schema,
                                   on_validation_failure }))
    }
}

impl SourcePlugin for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_schema(&self) -> &Schema {
        &self.schema
    }

    fn on_validation_failure(&self) -> &ErrorDisposition {
        &self.on_validation_failure
    }

    fn next_row(&mut self, _ctx: &PluginContext) -> Result<SourcePoll, PluginError> {
        match self.rows.get(self.cursor) {
            Some(row) => {
                self.cursor += 1;
                Ok(SourcePoll::Row(row.clone()))
            }
            None => Ok(SourcePoll::Exhausted),
        }
    }
}

/// Fuente JSONL: una fila por línea. Líneas no parseables son errores de
/// input (terminales): la fuente no adivina.
pub struct JsonlSource {
    name: String,
    reader: Option<BufReader<File>>,
    path: String,
    schema: Schema,
    on_validation_failure: ErrorDisposition,
}

impl JsonlSource {
    pub fn from_options(options: &Value) -> Result<Box<dyn SourcePlugin>, ConfigError> {
        let path = options.get("path")
                          .and_then(|p| p.as_str())
                          .ok_or_else(|| ConfigError::Invalid("jsonl source requires 'path'".to_string()))?
                          .to_string();
        let schema = schema_from_options(options)?;
        let on_validation_failure = options.get("on_validation_failure")
                                           .and_then(|v| v.as_str())
                                           .map(ErrorDisposition::from_config)
                                           .unwrap_or(ErrorDisposition::Discard);
        Ok(Box::new(JsonlSource { name: "jsonl".to_string(),
                                  reader: None,
                                  path,
                                  schema,
                                  on_validation_failure }))
    }
}

impl SourcePlugin for JsonlSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_schema(&self) -> &Schema {
        &self.schema
    }

    fn on_validation_failure(&self) -> &ErrorDisposition {
        &self.on_validation_failure
    }

    fn next_row(&mut self, _ctx: &PluginContext) -> Result<SourcePoll, PluginError> {
        if self.reader.is_none() {
            let file = File::open(&self.path)
                .map_err(|e| PluginError::new(PluginErrorKind::NotFound, format!("open {}: {e}", self.path)))?;
            self.reader = Some(BufReader::new(file));
        }
        let reader = self.reader.as_mut().expect("reader initialised above");
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line)
                             .map_err(|e| PluginError::new(PluginErrorKind::Network, format!("read: {e}")))?;
            if read == 0 {
                return Ok(SourcePoll::Exhausted);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let row = serde_json::from_str(trimmed)
                .map_err(|e| PluginError::new(PluginErrorKind::InvalidInput, format!("invalid JSONL line: {e}")))?;
            return Ok(SourcePoll::Row(row));
        }
    }
}
