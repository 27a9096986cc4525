//! Contrato del storage engine colaborador.
//!
//! El motor sólo necesita `begin → txn`, `txn.flush(buffered)`,
//! `txn.commit()` y `txn.rollback()`, más savepoints para delimitar cada
//! `PersistenceScope` dentro de la transacción del intervalo de suspensión.
//! La escritura de checkpoints pasa por la misma transacción, de modo que un
//! checkpoint nunca es visible sin sus escrituras asociadas (ni al revés).

use thiserror::Error;

use crate::errors::CoreEngineError;
use crate::hospital::HospitalRecord;
use crate::model::{Checkpoint, EntityRow, FlowId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("constraint violation on {table}/{key}: {detail}")]
    ConstraintViolation { table: String, key: String, detail: String },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("stale checkpoint for {flow_id}: expected {expected:?}, found {found:?}")]
    StaleCheckpoint { flow_id: FlowId, expected: Option<u64>, found: Option<u64> },
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl From<StorageError> for CoreEngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::ConstraintViolation { table, key, detail } => {
                CoreEngineError::ConstraintViolation { table, key, detail }
            }
            StorageError::Unavailable(m) => CoreEngineError::StorageUnavailable(m),
            StorageError::StaleCheckpoint { flow_id, expected, found } => {
                CoreEngineError::StaleCheckpoint { flow_id: flow_id.to_string(),
                                                   expected,
                                                   found }
            }
            StorageError::Serialization(m) => CoreEngineError::Serialization(m),
            StorageError::Backend(m) => CoreEngineError::Internal(m),
        }
    }
}

impl From<CoreEngineError> for StorageError {
    fn from(e: CoreEngineError) -> Self {
        match e {
            CoreEngineError::Serialization(m) | CoreEngineError::CheckpointCorrupted(m) => StorageError::Serialization(m),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

/// Transacción del storage engine que respalda un intervalo de suspensión.
///
/// Soltar la transacción sin `commit` equivale a un rollback (crash).
pub trait StorageTxn: Send {
    fn savepoint(&mut self, name: &str) -> Result<(), StorageError>;
    fn release_savepoint(&mut self, name: &str) -> Result<(), StorageError>;
    fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StorageError>;

    /// Aplica escrituras buffereadas. Las filas quedan visibles sólo dentro
    /// de esta transacción hasta el commit.
    fn flush(&mut self, rows: &[EntityRow]) -> Result<(), StorageError>;

    /// Registra `checkpoint` reemplazando al de secuencia `previous`
    /// (compare-and-set). `None` exige que el flow no tenga checkpoint.
    fn write_checkpoint(&mut self, checkpoint: &Checkpoint, previous: Option<u64>) -> Result<(), StorageError>;

    /// Elimina el checkpoint de `flow_id`, que debe estar en `expected_seq`.
    fn remove_checkpoint(&mut self, flow_id: FlowId, expected_seq: u64) -> Result<(), StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Storage engine compartido por todos los flows. Las claves siempre
/// incluyen el `FlowId` o la identidad de la entidad, de modo que flows
/// concurrentes nunca colisionan por construcción salvo en datos de
/// aplicación.
pub trait StorageEngine: Send + Sync + 'static {
    fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError>;

    /// Lectura fuera de cualquier transacción de flow (sólo datos confirmados).
    fn read_committed(&self, table: &str) -> Result<Vec<EntityRow>, StorageError>;

    fn load_checkpoint(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, StorageError>;
    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError>;

    fn upsert_hospital_record(&self, record: &HospitalRecord) -> Result<(), StorageError>;
    fn remove_hospital_record(&self, flow_id: FlowId) -> Result<(), StorageError>;
    fn hospital_records(&self) -> Result<Vec<HospitalRecord>, StorageError>;
}
