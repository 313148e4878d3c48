//! Errores semánticos del core.
//!
//! Taxonomía (ver también `plugin::PluginErrorKind` para errores de plugins):
//! - `ConfigError`: grafo inválido (ciclos, sinks inalcanzables, targets
//!   desconocidos, etiquetas reservadas, esquemas incompatibles). Aparece al
//!   arrancar e impide el run.
//! - `RecorderError`: una escritura al landscape falló. Fatal para el token
//!   (no se puede garantizar el invariante de outcome único sin registro);
//!   el token queda sin finalizar y será visible para recovery.
//! - `EngineError`: errores del motor en sí. Excepciones internas del core
//!   son bugs y deben tumbar el run con diagnóstico, nunca degradar en
//!   silencio.

use thiserror::Error;
use uuid::Uuid;

/// Errores de construcción/validación del grafo y de la configuración.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("cycle detected involving node '{0}'")]
    Cycle(String),
    #[error("sink '{0}' is not reachable from the source")]
    UnreachableSink(String),
    #[error("route '{label}' at gate '{gate}' references unknown sink '{target}'")]
    UnknownRouteTarget { gate: String, label: String, target: String },
    #[error("fork branch '{branch}' at gate '{gate}' matches no coalesce branch or sink (available: {available})")]
    UnknownForkBranch { gate: String, branch: String, available: String },
    #[error("label '{0}' uses the reserved '__' prefix")]
    ReservedLabel(String),
    #[error("incompatible edge {producer} -> {consumer}: consumer requires fields not produced: [{missing}]")]
    IncompatibleEdge { producer: String, consumer: String, missing: String },
    #[error("coalesce '{node}' receives incompatible schemas from '{left}' and '{right}': [{missing}]")]
    IncompatibleCoalesceInputs { node: String, left: String, right: String, missing: String },
    #[error("gate '{node}' receives disagreeing schemas from '{left}' and '{right}'")]
    GateProducersDisagree { node: String, left: String, right: String },
    #[error("unknown {capability} plugin '{name}'")]
    UnknownPlugin { capability: String, name: String },
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),
    #[error("edge references unknown node '{0}'")]
    UnknownNode(String),
    #[error("invalid gate condition '{expr}': {reason}")]
    InvalidCondition { expr: String, reason: String },
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Errores del landscape (audit store).
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Violación del invariante "un outcome terminal por token".
    #[error("terminal outcome already recorded for token {0}")]
    DuplicateTerminal(Uuid),
    #[error("unknown token {0}")]
    UnknownToken(Uuid),
    #[error("unknown run {0}")]
    UnknownRun(Uuid),
    #[error("unknown node state {0}")]
    UnknownNodeState(Uuid),
    /// Parentesco circular o padre creado después del hijo.
    #[error("parent link rejected for token {token}: {reason}")]
    InvalidParentLink { token: Uuid, reason: String },
    /// node_state ya cerrado: las transiciones son pending -> terminal, una vez.
    #[error("node state {0} is already terminal")]
    NodeStateAlreadyClosed(Uuid),
    #[error("serialization conflict (retryable)")]
    SerializationConflict,
    #[error("transient IO: {0}")]
    TransientIo(String),
    #[error("storage: {0}")]
    Storage(String),
}

impl RecorderError {
    /// Errores que un backend puede reintentar con backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecorderError::SerializationConflict | RecorderError::TransientIo(_))
    }
}

/// Error de nivel motor.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    /// El scheduler entregó un token ya finalizado: bug, no se degrada.
    #[error("token {0} already has a terminal outcome (scheduler bug)")]
    TokenAlreadyTerminal(Uuid),
    #[error("run {0} was canceled before completion")]
    Canceled(Uuid),
    #[error("internal: {0}")]
    Internal(String),
}
