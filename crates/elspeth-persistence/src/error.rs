//! Errores de persistencia.
//! Mapea errores de Diesel / conexión a variantes semánticas, y de ahí al
//! `RecorderError` del core (el contrato que ven engine y token manager).

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use elspeth_core::errors::RecorderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("check violation: {0}")]
    CheckViolation(String),
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
    #[error("not found")]
    NotFound,
    #[error("serialization conflict (retryable)")]
    SerializationConflict,
    #[error("transient IO / connection pool error: {0}")]
    TransientIo(String),
    #[error("unknown database error: {0}")]
    Unknown(String),
}

impl From<DieselError> for PersistenceError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => Self::UniqueViolation(info.message().to_string()),
                DatabaseErrorKind::CheckViolation => Self::CheckViolation(info.message().to_string()),
                DatabaseErrorKind::ForeignKeyViolation => Self::ForeignKeyViolation(info.message().to_string()),
                DatabaseErrorKind::SerializationFailure => Self::SerializationConflict,
                other => Self::Unknown(format!("db error kind {:?}: {}", other, info.message())),
            },
            DieselError::DeserializationError(e) => Self::Unknown(format!("deser: {e}")),
            DieselError::SerializationError(e) => Self::Unknown(format!("ser: {e}")),
            DieselError::BrokenTransactionManager => Self::TransientIo("broken transaction manager".into()),
            other => Self::Unknown(format!("diesel error: {other:?}")),
        }
    }
}

impl PersistenceError {
    /// Traducción al contrato del core. La violación del índice único
    /// parcial de outcomes se reporta aparte en `pg` (ahí se conoce el
    /// token); acá va el mapeo genérico.
    pub fn into_recorder(self) -> RecorderError {
        match self {
            PersistenceError::SerializationConflict => RecorderError::SerializationConflict,
            PersistenceError::TransientIo(msg) => RecorderError::TransientIo(msg),
            other => RecorderError::Storage(other.to_string()),
        }
    }
}
