//! Checkpoint store: registro durable del estado suspendido de cada flow.
//!
//! `save` y `delete` sólo existen dentro de una `StorageTxn`: el checkpoint
//! se confirma en el mismo commit que las escrituras del intervalo, nunca por
//! separado. Las lecturas verifican el fingerprint.

use std::sync::Arc;

use log::debug;

use crate::errors::CoreEngineError;
use crate::model::{Checkpoint, FlowId, ResumePoint};
use crate::storage::{StorageEngine, StorageTxn};

#[derive(Clone)]
pub struct CheckpointStore {
    engine: Arc<dyn StorageEngine>,
}

impl CheckpointStore {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }

    /// Registra `checkpoint` sobre el de secuencia `previous` (compare-and-set
    /// aplicado al confirmar `txn`).
    pub fn save(&self, txn: &mut dyn StorageTxn, checkpoint: &Checkpoint, previous: Option<u64>) -> Result<(), CoreEngineError> {
        if let Some(prev) = previous {
            if checkpoint.seq != prev + 1 {
                return Err(CoreEngineError::StaleCheckpoint { flow_id: checkpoint.flow_id.to_string(),
                                                              expected: Some(prev + 1),
                                                              found: Some(checkpoint.seq) });
            }
        }
        debug!("checkpoint:save flow_id={} seq={} prev={:?}",
               checkpoint.flow_id,
               checkpoint.seq,
               previous);
        txn.write_checkpoint(checkpoint, previous)?;
        Ok(())
    }

    pub fn delete(&self, txn: &mut dyn StorageTxn, flow_id: FlowId, seq: u64) -> Result<(), CoreEngineError> {
        debug!("checkpoint:delete flow_id={} seq={}", flow_id, seq);
        txn.remove_checkpoint(flow_id, seq)?;
        Ok(())
    }

    /// Último checkpoint confirmado del flow, verificado.
    pub fn load(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, CoreEngineError> {
        let Some(cp) = self.engine.load_checkpoint(flow_id)? else {
            return Ok(None);
        };
        cp.verify()?;
        Ok(Some(cp))
    }

    /// Todos los checkpoints confirmados, sin verificar: la recuperación
    /// verifica cada uno y aparta los corruptos sin abortar el resto.
    pub fn list(&self) -> Result<Vec<Checkpoint>, CoreEngineError> {
        Ok(self.engine.list_checkpoints()?)
    }

    /// Vista de operador: secuencia y punto de reanudación.
    pub fn inspect(&self, flow_id: FlowId) -> Result<Option<(u64, ResumePoint)>, CoreEngineError> {
        Ok(self.load(flow_id)?.map(|cp| (cp.seq, cp.resume_point)))
    }
}
