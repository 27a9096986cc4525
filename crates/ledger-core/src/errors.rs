//! Errores del core y su clasificación para el hospital de flows.
//!
//! `CoreEngineError` es el único tipo de error que intercambian la lógica de
//! los flows y el motor. Es `Clone + Serialize` porque viaja dentro de
//! `HospitalRecord` y de los eventos del hospital.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CoreEngineError {
    #[error("flow already completed")]
    FlowCompleted,
    #[error("unknown flow: {0}")]
    UnknownFlow(String),
    #[error("unknown step: {0}")]
    UnknownStep(String),
    #[error("no flow definition registered under '{0}'")]
    UnknownDefinition(String),
    #[error("definition hash mismatch (checkpoint {found}, registered {expected})")]
    DefinitionMismatch { expected: String, found: String },

    // --- Persistence scope ---
    #[error("a persistence scope is already open for this flow")]
    ScopeAlreadyOpen,
    #[error("no persistence scope is open")]
    NoOpenScope,
    /// Violación detectada por un `flush` (explícito o implícito al cerrar el
    /// scope). Recuperable: la lógica del flow puede capturarla.
    #[error("constraint violation on flush: {table}/{key}: {detail}")]
    ConstraintViolation { table: String, key: String, detail: String },
    /// Dos escrituras en conflicto dentro del mismo scope sin frontera de
    /// flush. No recuperable dentro del scope.
    #[error("conflicting writes inside a single scope: {table}/{key}")]
    ImplicitConstraintViolation { table: String, key: String },
    /// Intento de escribir en un scope ya ROLLED_BACK.
    #[error("persistence scope {scope} was rolled back and cannot be reused")]
    ScopeRolledBack { scope: u32 },
    /// El commit atómico checkpoint+scope de un punto de suspensión falló.
    #[error("suspension commit rolled back: {0}")]
    CommitRolledBack(String),

    // --- Storage / checkpoints ---
    #[error("storage engine unavailable: {0}")]
    StorageUnavailable(String),
    #[error("stale checkpoint for flow {flow_id}: expected seq {expected:?}, found {found:?}")]
    StaleCheckpoint { flow_id: String, expected: Option<u64>, found: Option<u64> },
    #[error("checkpoint fingerprint mismatch for flow {0}")]
    CheckpointCorrupted(String),

    // --- Sessions ---
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("timed out waiting for a message on session {0}")]
    ReceiveTimeout(String),
    #[error("no message available on session {0}")]
    NothingReceived(String),
    #[error("transport error: {0}")]
    Transport(String),

    // --- Flow logic ---
    #[error("contract rejected: {0}")]
    ContractRejected(String),
    #[error("non-retryable: {0}")]
    NonRetryable(String),
    #[error("flow cancelled")]
    Cancelled,
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl CoreEngineError {
    /// Atajo para que la lógica de un flow marque un error como terminal.
    pub fn non_retryable(reason: impl Into<String>) -> Self {
        Self::NonRetryable(reason.into())
    }
}

impl From<serde_json::Error> for CoreEngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Clase de error usada por la política del hospital.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Infraestructura: storage caído, timeout esperando a la contraparte,
    /// transporte.
    Transient,
    /// Violación detectada en flush que escapó de la lógica del flow.
    FlushConstraint,
    /// Conflicto al confirmar el punto de suspensión.
    CommitConflict,
    /// Escrituras internamente inconsistentes en un único scope.
    InconsistentScope,
    /// Escritura sobre un scope envenenado.
    ScopeReuse,
    /// Rechazo de reglas de negocio del verificador de contratos.
    Business,
    /// Marcado explícitamente como no reintentable por la lógica del flow.
    NonRetryable,
    /// Violaciones de contrato de programación (scopes anidados, pasos
    /// desconocidos, checkpoints corruptos...).
    Programming,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::FlushConstraint => "flush_constraint",
            ErrorClass::CommitConflict => "commit_conflict",
            ErrorClass::InconsistentScope => "inconsistent_scope",
            ErrorClass::ScopeReuse => "scope_reuse",
            ErrorClass::Business => "business",
            ErrorClass::NonRetryable => "non_retryable",
            ErrorClass::Programming => "programming",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "transient" => ErrorClass::Transient,
            "flush_constraint" => ErrorClass::FlushConstraint,
            "commit_conflict" => ErrorClass::CommitConflict,
            "inconsistent_scope" => ErrorClass::InconsistentScope,
            "scope_reuse" => ErrorClass::ScopeReuse,
            "business" => ErrorClass::Business,
            "non_retryable" => ErrorClass::NonRetryable,
            "programming" => ErrorClass::Programming,
            _ => return None,
        })
    }
}

/// Clasifica un error que escapó de la lógica de un flow.
pub fn classify_error(e: &CoreEngineError) -> ErrorClass {
    use CoreEngineError::*;
    match e {
        StorageUnavailable(_) | ReceiveTimeout(_) | Transport(_) => ErrorClass::Transient,
        ConstraintViolation { .. } => ErrorClass::FlushConstraint,
        CommitRolledBack(_) => ErrorClass::CommitConflict,
        ImplicitConstraintViolation { .. } => ErrorClass::InconsistentScope,
        ScopeRolledBack { .. } => ErrorClass::ScopeReuse,
        ContractRejected(_) => ErrorClass::Business,
        NonRetryable(_) | Cancelled => ErrorClass::NonRetryable,
        FlowCompleted
        | UnknownFlow(_)
        | UnknownStep(_)
        | UnknownDefinition(_)
        | DefinitionMismatch { .. }
        | ScopeAlreadyOpen
        | NoOpenScope
        | StaleCheckpoint { .. }
        | CheckpointCorrupted(_)
        | UnknownSession(_)
        | NothingReceived(_)
        | Serialization(_)
        | Internal(_) => ErrorClass::Programming,
    }
}
