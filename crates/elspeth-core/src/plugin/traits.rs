//! Contratos de capacidades que el engine consume (C1).
//!
//! Conjunto cerrado de cuatro capacidades: source, transform, gate, sink.
//! Cada plugin declara sus esquemas (posiblemente dinámicos), su ruteo de
//! error y su clase de determinismo. La construcción pasa por el
//! `PluginRegistry` (factory por nombre); no hay herencia abierta.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::Schema;

use super::context::PluginContext;
use super::error::PluginError;
use super::result::{GateDecision, SinkAck, SourcePoll, TransformResult};

/// Clase de determinismo declarada por el plugin. Para plugins
/// `Deterministic` el contrato es `input_hash -> output_hash` función
/// (mismo input, mismo output entre attempts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    Deterministic,
    IoDependent,
    ExternalCall,
}

/// Destino de filas que fallan (`on_error` / `on_validation_failure`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Registrar y poner en cuarentena; la fila no sigue.
    Discard,
    /// Desviar (edge DIVERT) al sink nombrado.
    Sink(String),
}

impl ErrorDisposition {
    pub fn from_config(value: &str) -> Self {
        if value == "discard" {
            ErrorDisposition::Discard
        } else {
            ErrorDisposition::Sink(value.to_string())
        }
    }
}

/// Destino declarado de una ruta de gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Continuar a la siguiente posición del pipeline.
    Continue,
    Sink(String),
}

/// Fuente de filas. `next_row` emite a lo sumo una fila por llamada y
/// devuelve `Exhausted` al agotarse.
pub trait SourcePlugin: Send {
    fn name(&self) -> &str;
    fn output_schema(&self) -> &Schema;
    fn on_validation_failure(&self) -> &ErrorDisposition;
    fn next_row(&mut self, ctx: &PluginContext) -> Result<SourcePoll, PluginError>;
}

/// Transform: 1 fila de entrada, 0..N de salida.
pub trait TransformPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn input_schema(&self) -> &Schema;
    fn output_schema(&self) -> &Schema;
    fn determinism(&self) -> Determinism;
    /// Ruteo cuando el transform devuelve error (None = el procesador decide
    /// con la política por defecto: discard).
    fn on_error(&self) -> Option<&ErrorDisposition> {
        None
    }
    fn process(&self, row: Value, ctx: &PluginContext) -> TransformResult;
}

/// Gate: decide ruta o fork. Nunca modifica la fila.
pub trait GatePlugin: Send + Sync {
    fn name(&self) -> &str;
    fn input_schema(&self) -> &Schema;
    /// Rutas declaradas (label -> target) en orden de declaración.
    fn routes(&self) -> Vec<(String, RouteTarget)>;
    /// Branches de fork declarados, si el gate forkea.
    fn fork_branches(&self) -> Option<Vec<String>> {
        None
    }
    fn decide(&self, row: &Value, ctx: &PluginContext) -> Result<GateDecision, PluginError>;
}

/// Sink: destino terminal de filas.
pub trait SinkPlugin: Send {
    fn name(&self) -> &str;
    fn input_schema(&self) -> &Schema;
    /// `true` si reentregar la misma fila produce un solo efecto observable.
    fn idempotent(&self) -> bool;
    fn determinism(&self) -> Determinism;
    fn write(&mut self, row: &Value, ctx: &PluginContext) -> Result<SinkAck, PluginError>;
    fn flush(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
    fn close(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}
