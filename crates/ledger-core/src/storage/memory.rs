//! Storage engine en memoria.
//!
//! Simula un motor relacional con unicidad por `(table, key)`, savepoints y
//! aislamiento read-committed: lo escrito en una transacción sólo se publica
//! en el commit, y el commit valida de nuevo las claves y los checkpoints
//! contra el estado confirmado (otro flow pudo confirmar antes).
//!
//! Incluye inyección de fallos para tests (`set_available`,
//! `fail_next_commits`).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use serde_json::Value;

use super::engine::{StorageEngine, StorageError, StorageTxn};
use crate::hospital::HospitalRecord;
use crate::model::{Checkpoint, EntityRow, FlowId};

const DUPLICATE_KEY: &str = "duplicate key value violates unique constraint";

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<String, BTreeMap<String, Value>>,
    checkpoints: HashMap<FlowId, Checkpoint>,
    hospital: HashMap<FlowId, HospitalRecord>,
}

impl MemoryState {
    fn contains(&self, row: &EntityRow) -> bool {
        self.tables
            .get(&row.table)
            .map(|t| t.contains_key(&row.key))
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct FaultPlan {
    unavailable: AtomicBool,
    failing_commits: AtomicU32,
}

/// Storage engine en memoria, clonable (comparte estado).
#[derive(Clone, Default)]
pub struct InMemoryStorageEngine {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<FaultPlan>,
}

impl InMemoryStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marca el motor como caído: toda operación devuelve `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.faults.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Hace fallar los próximos `n` commits (simula un crash entre flush y
    /// commit).
    pub fn fail_next_commits(&self, n: u32) {
        self.faults.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Número de filas confirmadas en `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock()
            .map(|s| s.tables.get(table).map(|t| t.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Backend("memory state poisoned".into()))
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("in-memory engine marked unavailable".into()));
        }
        Ok(())
    }

    fn take_commit_fault(&self) -> bool {
        self.faults
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

enum CheckpointOp {
    Save { checkpoint: Checkpoint, previous: Option<u64> },
    Remove { flow_id: FlowId, expected: u64 },
}

impl CheckpointOp {
    fn flow_id(&self) -> FlowId {
        match self {
            CheckpointOp::Save { checkpoint, .. } => checkpoint.flow_id,
            CheckpointOp::Remove { flow_id, .. } => *flow_id,
        }
    }
}

/// Transacción en memoria: buffer ordenado de escrituras + pila de savepoints.
pub struct MemoryTxn {
    engine: InMemoryStorageEngine,
    writes: Vec<EntityRow>,
    written: HashSet<(String, String)>,
    savepoints: Vec<(String, usize)>,
    checkpoint_ops: Vec<CheckpointOp>,
}

impl MemoryTxn {
    fn savepoint_position(&self, name: &str) -> Result<usize, StorageError> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| StorageError::Backend(format!("unknown savepoint {name}")))
    }

    fn violation(row: &EntityRow) -> StorageError {
        StorageError::ConstraintViolation { table: row.table.clone(),
                                            key: row.key.clone(),
                                            detail: DUPLICATE_KEY.into() }
    }
}

impl StorageTxn for MemoryTxn {
    fn savepoint(&mut self, name: &str) -> Result<(), StorageError> {
        self.savepoints.push((name.to_string(), self.writes.len()));
        Ok(())
    }

    fn release_savepoint(&mut self, name: &str) -> Result<(), StorageError> {
        let pos = self.savepoint_position(name)?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StorageError> {
        let pos = self.savepoint_position(name)?;
        let mark = self.savepoints[pos].1;
        for row in self.writes.drain(mark..) {
            self.written.remove(&row.identity());
        }
        self.savepoints.truncate(pos + 1);
        Ok(())
    }

    fn flush(&mut self, rows: &[EntityRow]) -> Result<(), StorageError> {
        self.engine.check_available()?;
        {
            let state = self.engine.lock()?;
            let mut batch: HashSet<(String, String)> = HashSet::new();
            for row in rows {
                let id = row.identity();
                if state.contains(row) || self.written.contains(&id) || !batch.insert(id) {
                    debug!("flush:violation table={} key={}", row.table, row.key);
                    return Err(Self::violation(row));
                }
            }
        }
        for row in rows {
            self.written.insert(row.identity());
            self.writes.push(row.clone());
        }
        Ok(())
    }

    fn write_checkpoint(&mut self, checkpoint: &Checkpoint, previous: Option<u64>) -> Result<(), StorageError> {
        self.checkpoint_ops.push(CheckpointOp::Save { checkpoint: checkpoint.clone(),
                                                      previous });
        Ok(())
    }

    fn remove_checkpoint(&mut self, flow_id: FlowId, expected_seq: u64) -> Result<(), StorageError> {
        self.checkpoint_ops.push(CheckpointOp::Remove { flow_id,
                                                        expected: expected_seq });
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTxn { engine,
                        writes,
                        checkpoint_ops,
                        .. } = *self;
        engine.check_available()?;
        if engine.take_commit_fault() {
            return Err(StorageError::Unavailable("injected commit failure".into()));
        }
        let mut state = engine.lock()?;

        // Validación completa antes de publicar nada.
        for row in &writes {
            if state.contains(row) {
                return Err(Self::violation(row));
            }
        }
        let mut expected_seq: HashMap<FlowId, Option<u64>> = HashMap::new();
        for op in &checkpoint_ops {
            let flow_id = op.flow_id();
            let current = match expected_seq.get(&flow_id) {
                Some(seq) => *seq,
                None => state.checkpoints.get(&flow_id).map(|c| c.seq),
            };
            let (expected, next) = match op {
                CheckpointOp::Save { checkpoint, previous } => (*previous, Some(checkpoint.seq)),
                CheckpointOp::Remove { expected, .. } => (Some(*expected), None),
            };
            if current != expected {
                return Err(StorageError::StaleCheckpoint { flow_id,
                                                           expected,
                                                           found: current });
            }
            expected_seq.insert(flow_id, next);
        }

        for row in writes {
            state.tables.entry(row.table).or_default().insert(row.key, row.payload);
        }
        for op in checkpoint_ops {
            match op {
                CheckpointOp::Save { checkpoint, .. } => {
                    state.checkpoints.insert(checkpoint.flow_id, checkpoint);
                }
                CheckpointOp::Remove { flow_id, .. } => {
                    state.checkpoints.remove(&flow_id);
                }
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

impl StorageEngine for InMemoryStorageEngine {
    fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError> {
        self.check_available()?;
        Ok(Box::new(MemoryTxn { engine: self.clone(),
                                writes: Vec::new(),
                                written: HashSet::new(),
                                savepoints: Vec::new(),
                                checkpoint_ops: Vec::new() }))
    }

    fn read_committed(&self, table: &str) -> Result<Vec<EntityRow>, StorageError> {
        self.check_available()?;
        let state = self.lock()?;
        Ok(state.tables
                .get(table)
                .map(|t| {
                    t.iter()
                     .map(|(k, v)| EntityRow::new(table, k.clone(), v.clone()))
                     .collect()
                })
                .unwrap_or_default())
    }

    fn load_checkpoint(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, StorageError> {
        self.check_available()?;
        Ok(self.lock()?.checkpoints.get(&flow_id).cloned())
    }

    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError> {
        self.check_available()?;
        let mut all: Vec<Checkpoint> = self.lock()?.checkpoints.values().cloned().collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }

    fn upsert_hospital_record(&self, record: &HospitalRecord) -> Result<(), StorageError> {
        self.lock()?.hospital.insert(record.flow_id, record.clone());
        Ok(())
    }

    fn remove_hospital_record(&self, flow_id: FlowId) -> Result<(), StorageError> {
        self.lock()?.hospital.remove(&flow_id);
        Ok(())
    }

    fn hospital_records(&self) -> Result<Vec<HospitalRecord>, StorageError> {
        Ok(self.lock()?.hospital.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(key: &str) -> EntityRow {
        EntityRow::new("custom_table", key, json!({ "id": key }))
    }

    #[test]
    fn writes_are_invisible_until_commit() {
        let engine = InMemoryStorageEngine::new();
        let mut txn = engine.begin().unwrap();
        txn.flush(&[row("1"), row("2")]).unwrap();
        assert_eq!(engine.row_count("custom_table"), 0);
        txn.commit().unwrap();
        assert_eq!(engine.row_count("custom_table"), 2);
    }

    #[test]
    fn duplicate_inside_txn_is_a_violation() {
        let engine = InMemoryStorageEngine::new();
        let mut txn = engine.begin().unwrap();
        txn.flush(&[row("1")]).unwrap();
        let err = txn.flush(&[row("1")]).unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation { .. }));
    }

    #[test]
    fn rollback_to_savepoint_discards_only_later_writes() {
        let engine = InMemoryStorageEngine::new();
        let mut txn = engine.begin().unwrap();
        txn.savepoint("a").unwrap();
        txn.flush(&[row("1")]).unwrap();
        txn.release_savepoint("a").unwrap();
        txn.savepoint("b").unwrap();
        txn.flush(&[row("2")]).unwrap();
        txn.rollback_to_savepoint("b").unwrap();
        // la clave 2 vuelve a estar libre tras el rollback
        txn.flush(&[row("3")]).unwrap();
        txn.commit().unwrap();
        let keys: Vec<String> = engine.read_committed("custom_table")
                                      .unwrap()
                                      .into_iter()
                                      .map(|r| r.key)
                                      .collect();
        assert_eq!(keys, vec!["1".to_string(), "3".to_string()]);
    }

    #[test]
    fn concurrent_commit_of_same_key_conflicts_at_commit() {
        let engine = InMemoryStorageEngine::new();
        let mut a = engine.begin().unwrap();
        let mut b = engine.begin().unwrap();
        a.flush(&[row("1")]).unwrap();
        b.flush(&[row("1")]).unwrap();
        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(StorageError::ConstraintViolation { .. })));
        assert_eq!(engine.row_count("custom_table"), 1);
    }

    #[test]
    fn injected_commit_failure_applies_nothing() {
        let engine = InMemoryStorageEngine::new();
        engine.fail_next_commits(1);
        let mut txn = engine.begin().unwrap();
        txn.flush(&[row("1")]).unwrap();
        assert!(matches!(txn.commit(), Err(StorageError::Unavailable(_))));
        assert_eq!(engine.row_count("custom_table"), 0);
        let mut txn = engine.begin().unwrap();
        txn.flush(&[row("1")]).unwrap();
        txn.commit().unwrap();
        assert_eq!(engine.row_count("custom_table"), 1);
    }
}
