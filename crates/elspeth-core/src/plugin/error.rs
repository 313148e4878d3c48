//! Clasificación de errores de plugins.
//!
//! La clase decide el comportamiento del procesador: los kinds retryables se
//! capturan y reintentan dentro del presupuesto configurado; los terminales
//! se convierten de inmediato en un resultado de error tipado.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind del error reportado por un plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginErrorKind {
    // Retryables (transitorios)
    RateLimit,
    Network,
    Server,
    Timeout,
    // Terminales
    NotFound,
    Forbidden,
    Unauthorized,
    Ssl,
    InvalidInput,
    SsrfBlocked,
    ResponseTooLarge,
    ConversionTimeout,
}

impl PluginErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self,
                 PluginErrorKind::RateLimit | PluginErrorKind::Network | PluginErrorKind::Server | PluginErrorKind::Timeout)
    }
}

/// Error devuelto por la invocación de un plugin.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct PluginError {
    pub kind: PluginErrorKind,
    pub message: String,
}

impl PluginError {
    pub fn new(kind: PluginErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
