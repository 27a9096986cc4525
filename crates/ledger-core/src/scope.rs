//! Persistence scopes: unidades delimitadas de escrituras buffereadas.
//!
//! Todas las scopes abiertas por un flow entre dos checkpoints comparten una
//! única `StorageTxn` (iniciada de forma perezosa) y cada scope se delimita
//! con un savepoint. Ciclo de vida:
//!
//! ```text
//! OPEN --close/flush ok--> FLUSHED --commit--> COMMITTED
//!   \--violación---------> ROLLED_BACK
//! ```
//!
//! Dos clases de violación:
//! - Clave ya gestionada por la propia scope (escrituras internamente
//!   inconsistentes): `ImplicitConstraintViolation`. Se registra como fatal y
//!   escapa de la scope aunque el cuerpo la capture.
//! - Rechazo del storage engine contra datos de otras scopes o confirmados:
//!   `ConstraintViolation`, recuperable por la lógica del flow.
//!
//! Una scope ROLLED_BACK queda envenenada: cualquier `persist`/`flush`
//! posterior falla con `ScopeRolledBack` (también fatal).

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, warn};

use crate::constants::SCOPE_SAVEPOINT_PREFIX;
use crate::errors::CoreEngineError;
use crate::model::{EntityRow, ScopeId};
use crate::storage::{StorageEngine, StorageError, StorageTxn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Open,
    Flushed,
    Committed,
    RolledBack,
}

struct OpenScope {
    id: ScopeId,
    state: ScopeState,
    buffer: Vec<EntityRow>,
    managed: HashSet<(String, String)>,
}

impl OpenScope {
    fn savepoint(&self) -> String {
        format!("{SCOPE_SAVEPOINT_PREFIX}{}", self.id.0)
    }
}

/// Seguimiento de las scopes de un flow dentro del intervalo de suspensión
/// actual.
pub struct ScopeTracker {
    storage: Arc<dyn StorageEngine>,
    txn: Option<Box<dyn StorageTxn>>,
    current: Option<OpenScope>,
    history: Vec<(ScopeId, ScopeState)>,
    next_id: u32,
    fatal: Option<CoreEngineError>,
}

impl ScopeTracker {
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        Self { storage,
               txn: None,
               current: None,
               history: Vec::new(),
               next_id: 1,
               fatal: None }
    }

    fn txn(&mut self) -> Result<&mut Box<dyn StorageTxn>, CoreEngineError> {
        if self.txn.is_none() {
            self.txn = Some(self.storage.begin()?);
        }
        self.txn
            .as_mut()
            .ok_or_else(|| CoreEngineError::Internal("storage transaction missing".into()))
    }

    fn set_state(&mut self, id: ScopeId, state: ScopeState) {
        match self.history.iter_mut().find(|(s, _)| *s == id) {
            Some(entry) => entry.1 = state,
            None => self.history.push((id, state)),
        }
    }

    /// Estado de una scope del intervalo actual o del último intervalo cerrado.
    pub fn state_of(&self, id: ScopeId) -> Option<ScopeState> {
        self.history.iter().find(|(s, _)| *s == id).map(|(_, st)| *st)
    }

    pub fn current(&self) -> Option<ScopeId> {
        self.current.as_ref().map(|s| s.id)
    }

    pub fn fatal(&self) -> Option<&CoreEngineError> {
        self.fatal.as_ref()
    }

    pub(crate) fn take_fatal(&mut self) -> Option<CoreEngineError> {
        self.fatal.take()
    }

    fn record_fatal(&mut self, err: CoreEngineError) -> CoreEngineError {
        if self.fatal.is_none() {
            self.fatal = Some(err.clone());
        }
        err
    }

    pub fn open(&mut self) -> Result<ScopeId, CoreEngineError> {
        if let Some(open) = &self.current {
            debug!("scope:open rejected, {} still open", open.id);
            return Err(CoreEngineError::ScopeAlreadyOpen);
        }
        let id = ScopeId(self.next_id);
        let scope = OpenScope { id,
                                state: ScopeState::Open,
                                buffer: Vec::new(),
                                managed: HashSet::new() };
        let savepoint = scope.savepoint();
        self.txn()?.savepoint(&savepoint)?;
        self.next_id += 1;
        self.current = Some(scope);
        self.set_state(id, ScopeState::Open);
        debug!("scope:open {}", id);
        Ok(id)
    }

    /// Bufferea una fila en la scope abierta; no comprueba restricciones.
    pub fn persist(&mut self, row: EntityRow) -> Result<(), CoreEngineError> {
        let scope = self.current.as_mut().ok_or(CoreEngineError::NoOpenScope)?;
        if scope.state == ScopeState::RolledBack {
            let err = CoreEngineError::ScopeRolledBack { scope: scope.id.0 };
            return Err(self.record_fatal(err));
        }
        scope.buffer.push(row);
        Ok(())
    }

    /// Aplica el buffer de la scope abierta a la transacción del intervalo.
    pub fn flush(&mut self) -> Result<(), CoreEngineError> {
        let scope = self.current.as_mut().ok_or(CoreEngineError::NoOpenScope)?;
        if scope.state == ScopeState::RolledBack {
            let err = CoreEngineError::ScopeRolledBack { scope: scope.id.0 };
            return Err(self.record_fatal(err));
        }
        let id = scope.id;
        let savepoint = scope.savepoint();
        let rows = std::mem::take(&mut scope.buffer);
        if rows.is_empty() {
            return Ok(());
        }

        let mut inconsistent = None;
        for row in &rows {
            if !scope.managed.insert(row.identity()) {
                inconsistent = Some(CoreEngineError::ImplicitConstraintViolation { table: row.table.clone(),
                                                                                  key: row.key.clone() });
                break;
            }
        }
        if let Some(err) = inconsistent {
            warn!("scope:flush {} inconsistent writes: {}", id, err);
            self.poison(id, &savepoint);
            return Err(self.record_fatal(err));
        }

        match self.txn()?.flush(&rows) {
            Ok(()) => {
                debug!("scope:flush {} rows={}", id, rows.len());
                Ok(())
            }
            Err(e) => {
                debug!("scope:flush {} rejected: {}", id, e);
                self.poison(id, &savepoint);
                Err(e.into())
            }
        }
    }

    fn poison(&mut self, id: ScopeId, savepoint: &str) {
        if let Some(txn) = self.txn.as_mut() {
            if let Err(e) = txn.rollback_to_savepoint(savepoint) {
                warn!("scope:rollback {} failed: {}", id, e);
            }
        }
        if let Some(scope) = self.current.as_mut() {
            scope.state = ScopeState::RolledBack;
            scope.buffer.clear();
        }
        self.set_state(id, ScopeState::RolledBack);
    }

    /// Cierra la scope abierta: flush implícito y liberación del savepoint.
    /// Una scope ya envenenada se descarta sin error.
    pub fn close(&mut self) -> Result<(), CoreEngineError> {
        let Some(scope) = self.current.as_ref() else {
            return Err(CoreEngineError::NoOpenScope);
        };
        let id = scope.id;
        let savepoint = scope.savepoint();
        if scope.state == ScopeState::RolledBack {
            self.current = None;
            debug!("scope:close {} discarded (rolled back)", id);
            return Ok(());
        }
        let flushed = self.flush();
        self.current = None;
        flushed?;
        self.txn()?.release_savepoint(&savepoint)?;
        self.set_state(id, ScopeState::Flushed);
        debug!("scope:close {} flushed", id);
        Ok(())
    }

    /// El cuerpo de la scope falló: se deshacen sus escrituras.
    pub fn abort(&mut self) {
        if let Some(scope) = self.current.take() {
            let savepoint = scope.savepoint();
            if scope.state != ScopeState::RolledBack {
                if let Some(txn) = self.txn.as_mut() {
                    if let Err(e) = txn.rollback_to_savepoint(&savepoint) {
                        warn!("scope:abort {} rollback failed: {}", scope.id, e);
                    }
                }
            }
            self.set_state(scope.id, ScopeState::RolledBack);
            debug!("scope:abort {}", scope.id);
        }
    }

    /// Prepara el punto de suspensión: una scope abierta se cierra de forma
    /// implícita; una envenenada (o con error fatal pendiente) hace fallar el
    /// commit.
    pub fn prepare_suspend(&mut self) -> Result<(), CoreEngineError> {
        if let Some(fatal) = self.fatal.clone() {
            return Err(fatal);
        }
        let Some(scope) = self.current.as_ref() else {
            return Ok(());
        };
        if scope.state == ScopeState::RolledBack {
            let id = scope.id;
            self.current = None;
            return Err(CoreEngineError::CommitRolledBack(format!("{id} was rolled back and is still open")));
        }
        match self.close() {
            Ok(()) => Ok(()),
            Err(CoreEngineError::ConstraintViolation { table, key, detail }) => {
                Err(CoreEngineError::CommitRolledBack(format!("unresolved violation on {table}/{key}: {detail}")))
            }
            Err(e) => Err(e),
        }
    }

    /// Confirma el intervalo: ejecuta `op` (checkpoint) en la transacción
    /// compartida y hace commit. Las scopes FLUSHED pasan a COMMITTED.
    pub fn commit_with<F>(&mut self, op: F) -> Result<(), CoreEngineError>
        where F: FnOnce(&mut dyn StorageTxn) -> Result<(), CoreEngineError>
    {
        let mut txn = match self.txn.take() {
            Some(t) => t,
            None => self.storage.begin()?,
        };
        if let Err(e) = op(txn.as_mut()) {
            if let Err(rb) = txn.rollback() {
                warn!("scope:commit rollback failed: {}", rb);
            }
            self.discard_interval(ScopeState::RolledBack);
            return Err(e);
        }
        match txn.commit() {
            Ok(()) => {
                self.discard_interval(ScopeState::Committed);
                Ok(())
            }
            Err(e) => {
                self.discard_interval(ScopeState::RolledBack);
                Err(match e {
                        StorageError::ConstraintViolation { table, key, detail } => {
                            CoreEngineError::CommitRolledBack(format!("{table}/{key}: {detail}"))
                        }
                        other => other.into(),
                    })
            }
        }
    }

    /// Abandona el intervalo (fallo o crash): rollback de todo lo pendiente.
    pub fn abandon(&mut self) {
        if let Some(txn) = self.txn.take() {
            if let Err(e) = txn.rollback() {
                warn!("scope:abandon rollback failed: {}", e);
            }
        }
        self.discard_interval(ScopeState::RolledBack);
    }

    fn discard_interval(&mut self, flushed_to: ScopeState) {
        self.current = None;
        self.fatal = None;
        // Sólo se conservan las scopes que este intervalo resuelve.
        self.history.retain(|(_, state)| matches!(state, ScopeState::Flushed | ScopeState::Open));
        for (_, state) in self.history.iter_mut() {
            if matches!(state, ScopeState::Flushed | ScopeState::Open) {
                *state = flushed_to;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorageEngine;
    use serde_json::json;

    fn row(key: &str) -> EntityRow {
        EntityRow::new("custom_table", key, json!({ "id": key }))
    }

    fn tracker() -> (InMemoryStorageEngine, ScopeTracker) {
        let engine = InMemoryStorageEngine::new();
        let t = ScopeTracker::new(Arc::new(engine.clone()));
        (engine, t)
    }

    fn commit(t: &mut ScopeTracker) -> Result<(), CoreEngineError> {
        t.commit_with(|_| Ok(()))
    }

    #[test]
    fn nested_open_fails_fast() {
        let (_, mut t) = tracker();
        t.open().unwrap();
        assert_eq!(t.open(), Err(CoreEngineError::ScopeAlreadyOpen));
    }

    #[test]
    fn buffered_rows_are_invisible_until_commit() {
        let (engine, mut t) = tracker();
        let id = t.open().unwrap();
        for k in ["1", "2", "3"] {
            t.persist(row(k)).unwrap();
        }
        t.close().unwrap();
        assert_eq!(t.state_of(id), Some(ScopeState::Flushed));
        assert_eq!(engine.row_count("custom_table"), 0);
        commit(&mut t).unwrap();
        assert_eq!(t.state_of(id), Some(ScopeState::Committed));
        assert_eq!(engine.row_count("custom_table"), 3);
    }

    #[test]
    fn history_keeps_only_the_last_interval() {
        let (engine, mut t) = tracker();
        let mut last = None;
        for i in 0..50 {
            let id = t.open().unwrap();
            t.persist(row(&i.to_string())).unwrap();
            t.close().unwrap();
            commit(&mut t).unwrap();
            last = Some(id);
        }
        assert_eq!(t.history.len(), 1);
        assert_eq!(t.state_of(last.unwrap()), Some(ScopeState::Committed));
        assert_eq!(engine.row_count("custom_table"), 50);
    }

    #[test]
    fn duplicate_in_same_scope_is_fatal() {
        let (engine, mut t) = tracker();
        t.open().unwrap();
        t.persist(row("1")).unwrap();
        t.persist(row("1")).unwrap();
        let err = t.close().unwrap_err();
        assert!(matches!(err, CoreEngineError::ImplicitConstraintViolation { .. }));
        assert!(t.fatal().is_some());
        assert!(t.prepare_suspend().is_err());
        t.abandon();
        assert_eq!(engine.row_count("custom_table"), 0);
    }

    #[test]
    fn flush_violation_poisons_only_that_scope() {
        let (engine, mut t) = tracker();
        let a = t.open().unwrap();
        t.persist(row("1")).unwrap();
        t.close().unwrap();

        let b = t.open().unwrap();
        t.persist(row("1")).unwrap();
        let err = t.flush().unwrap_err();
        assert!(matches!(err, CoreEngineError::ConstraintViolation { .. }));
        assert!(t.fatal().is_none());
        assert_eq!(t.state_of(b), Some(ScopeState::RolledBack));

        let reuse = t.persist(row("2")).unwrap_err();
        assert_eq!(reuse, CoreEngineError::ScopeRolledBack { scope: b.0 });
        assert_eq!(t.fatal(), Some(&reuse));
        t.abandon();
        assert_eq!(t.state_of(a), Some(ScopeState::RolledBack));
        assert_eq!(engine.row_count("custom_table"), 0);
    }

    #[test]
    fn fresh_scope_after_caught_violation_commits() {
        let (engine, mut t) = tracker();
        t.open().unwrap();
        t.persist(row("1")).unwrap();
        t.close().unwrap();
        t.open().unwrap();
        t.persist(row("1")).unwrap();
        assert!(t.flush().is_err());
        t.close().unwrap();
        t.open().unwrap();
        t.persist(row("2")).unwrap();
        t.persist(row("3")).unwrap();
        t.close().unwrap();
        t.prepare_suspend().unwrap();
        commit(&mut t).unwrap();
        assert_eq!(engine.row_count("custom_table"), 3);
    }

    #[test]
    fn suspending_inside_poisoned_scope_rolls_back_commit() {
        let (engine, mut t) = tracker();
        engine.begin().and_then(|mut txn| {
                          txn.flush(&[row("1")])?;
                          txn.commit()
                      })
              .unwrap();
        t.open().unwrap();
        t.persist(row("1")).unwrap();
        assert!(t.flush().is_err());
        assert!(matches!(t.prepare_suspend(), Err(CoreEngineError::CommitRolledBack(_))));
    }

    #[test]
    fn open_scope_is_closed_implicitly_at_suspension() {
        let (engine, mut t) = tracker();
        t.open().unwrap();
        t.persist(row("7")).unwrap();
        t.prepare_suspend().unwrap();
        assert!(t.current().is_none());
        commit(&mut t).unwrap();
        assert_eq!(engine.row_count("custom_table"), 1);
    }

    #[test]
    fn failed_commit_applies_nothing() {
        let (engine, mut t) = tracker();
        t.open().unwrap();
        t.persist(row("1")).unwrap();
        t.close().unwrap();
        engine.fail_next_commits(1);
        assert!(matches!(commit(&mut t), Err(CoreEngineError::StorageUnavailable(_))));
        assert_eq!(engine.row_count("custom_table"), 0);
    }
}
