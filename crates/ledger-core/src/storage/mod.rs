//! Colaborador de almacenamiento: contrato y motor en memoria.

mod engine;
mod memory;

pub use engine::{StorageEngine, StorageError, StorageTxn};
pub use memory::{InMemoryStorageEngine, MemoryTxn};
