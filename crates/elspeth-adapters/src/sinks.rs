//! Sinks de referencia.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::{Arc, Mutex};

use elspeth_core::errors::ConfigError;
use elspeth_core::hashing::content_hash;
use elspeth_core::plugin::{Determinism, PluginContext, PluginError, PluginErrorKind, SinkAck, SinkPlugin};
use elspeth_core::schema::Schema;
use serde_json::Value;

use crate::schema_from_options;

/// Sink en memoria con captura compartida; con `idempotent` activado deduce
/// por hash de contenido (reentrega de la misma fila = un solo efecto).
pub struct MemorySink {
    name: String,
    captured: Arc<Mutex<Vec<Value>>>,
    seen: Vec<String>,
    idempotent: bool,
    schema: Schema,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capture(Arc::new(Mutex::new(Vec::new())))
    }

    /// Captura compartida para que los tests inspeccionen lo escrito.
    pub fn with_capture(captured: Arc<Mutex<Vec<Value>>>) -> Self {
        Self { name: "memory".to_string(),
               captured,
               seen: Vec::new(),
               idempotent: false,
               schema: Schema::Dynamic }
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn capture_handle(&self) -> Arc<Mutex<Vec<Value>>> {
        Arc::clone(&self.captured)
    }

    pub fn from_options(options: &Value) -> Result<Box<dyn SinkPlugin>, ConfigError> {
        let schema = schema_from_options(options)?;
        let idempotent = options.get("idempotent").and_then(|i| i.as_bool()).unwrap_or(false);
        let mut sink = MemorySink::new();
        sink.schema = schema;
        sink.idempotent = idempotent;
        Ok(Box::new(sink))
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkPlugin for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Schema {
        &self.schema
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn write(&mut self, row: &Value, _ctx: &PluginContext) -> Result<SinkAck, PluginError> {
        if self.idempotent {
            let hash = content_hash(row);
            if self.seen.contains(&hash) {
                return Ok(SinkAck { deduplicated: true });
            }
            self.seen.push(hash);
        }
        self.captured
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(row.clone());
        Ok(SinkAck::default())
    }
}

/// Sink JSONL: una fila por línea, en orden de escritura.
pub struct JsonlSink {
    name: String,
    path: String,
    writer: Option<BufWriter<File>>,
    schema: Schema,
}

impl JsonlSink {
    pub fn new(path: &str) -> Self {
        Self { name: "jsonl".to_string(),
               path: path.to_string(),
               writer: None,
               schema: Schema::Dynamic }
    }

    pub fn from_options(options: &Value) -> Result<Box<dyn SinkPlugin>, ConfigError> {
        let path = options.get("path")
                          .and_then(|p| p.as_str())
                          .ok_or_else(|| ConfigError::Invalid("jsonl sink requires 'path'".to_string()))?;
        let schema = schema_from_options(options)?;
        let mut sink = JsonlSink::new(path);
        sink.schema = schema;
        Ok(Box::new(sink))
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, PluginError> {
        if self.writer.is_none() {
            let file = OpenOptions::new().create(true)
                                         .append(true)
                                         .open(&self.path)
                                         .map_err(|e| PluginError::new(PluginErrorKind::Server,
                                                                       format!("open {}: {e}", self.path)))?;
            self.writer = Some(BufWriter::new(file));
        }
        Ok(self.writer.as_mut().expect("writer initialised above"))
    }
}

impl SinkPlugin for JsonlSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Schema {
        &self.schema
    }

    fn idempotent(&self) -> bool {
        false
    }

    fn determinism(&self) -> Determinism {
        Determinism::IoDependent
    }

    fn write(&mut self, row: &Value, _ctx: &PluginContext) -> Result<SinkAck, PluginError> {
        let line = serde_json::to_string(row)
            .map_err(|e| PluginError::new(PluginErrorKind::InvalidInput, format!("serialize: {e}")))?;
        let writer = self.writer()?;
        writeln!(writer, "{line}").map_err(|e| PluginError::new(PluginErrorKind::Server, format!("write: {e}")))?;
        Ok(SinkAck::default())
    }

    fn flush(&mut self) -> Result<(), PluginError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()
                  .map_err(|e| PluginError::new(PluginErrorKind::Server, format!("flush: {e}")))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), PluginError> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }
}

/// Sink que descarta todo. Destino de cuarentena en pipelines que sólo
/// necesitan el registro de auditoría.
pub struct NullSink {
    name: String,
    schema: Schema,
}

impl NullSink {
    pub fn new() -> Self {
        Self { name: "null".to_string(), schema: Schema::Dynamic }
    }

    pub fn from_options(_options: &Value) -> Result<Box<dyn SinkPlugin>, ConfigError> {
        Ok(Box::new(Self::new()))
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkPlugin for NullSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Schema {
        &self.schema
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn write(&mut self, _row: &Value, _ctx: &PluginContext) -> Result<SinkAck, PluginError> {
        Ok(SinkAck::default())
    }
}
