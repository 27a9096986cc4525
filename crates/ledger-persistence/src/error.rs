//! Errores de persistencia.
//! Mapea errores de Diesel / conexión a variantes semánticas y de ahí al
//! `StorageError` que consume el core.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use ledger_core::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("check violation: {0}")]
    CheckViolation(String),
    #[error("not found")]
    NotFound,
    #[error("serialization conflict (retryable)")]
    SerializationConflict,
    #[error("transient IO / connection pool error: {0}")]
    TransientIo(String),
    #[error("missing configuration: {0}")]
    MissingConfig(String),
    #[error("row decode: {0}")]
    Decode(String),
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
                DatabaseErrorKind::SerializationFailure => Self::SerializationConflict,
                DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::UnableToSendCommand => {
                    Self::TransientIo(info.message().to_string())
                }
                other => Self::Unknown(format!("db error kind {:?}: {}", other, info.message())),
            },
            DieselError::DeserializationError(e) => Self::Decode(format!("deser: {e}")),
            DieselError::SerializationError(e) => Self::Decode(format!("ser: {e}")),
            DieselError::BrokenTransactionManager => Self::TransientIo("broken transaction manager".into()),
            other => Self::Unknown(format!("unhandled diesel error: {other:?}")),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<PersistenceError> for StorageError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::TransientIo(m) => StorageError::Unavailable(m),
            PersistenceError::SerializationConflict => StorageError::Unavailable("serialization conflict".into()),
            PersistenceError::Decode(m) => StorageError::Serialization(m),
            other => StorageError::Backend(other.to_string()),
        }
    }
}
