//! Contexto de ejecución que la máquina de estados presta a cada step.
//!
//! Agrupa los locals capturados (que viajan en el checkpoint), las scopes de
//! persistencia del intervalo, las sesiones y los servicios colaboradores.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::constants::INPUT_LOCAL;
use crate::errors::CoreEngineError;
use crate::model::{Entity, FlowId, ScopeId, SessionId};
use crate::scope::ScopeTracker;
use crate::services::{ProposedTransaction, ServiceHub, Signature};
use crate::session::{SessionMessenger, Transport};
use crate::storage::StorageEngine;

/// Colaboradores compartidos por todos los flows de un scheduler.
#[derive(Clone)]
pub struct FlowEnv {
    pub storage: Arc<dyn StorageEngine>,
    pub transport: Arc<dyn Transport>,
    pub services: ServiceHub,
}

impl FlowEnv {
    pub fn new(storage: Arc<dyn StorageEngine>, transport: Arc<dyn Transport>, services: ServiceHub) -> Self {
        Self { storage,
               transport,
               services }
    }
}

pub struct FlowContext {
    flow_id: FlowId,
    pub(crate) locals: Map<String, Value>,
    pub(crate) scopes: ScopeTracker,
    pub(crate) sessions: SessionMessenger,
    env: FlowEnv,
}

impl FlowContext {
    pub(crate) fn new(flow_id: FlowId, locals: Map<String, Value>, sessions: SessionMessenger, env: FlowEnv) -> Self {
        Self { flow_id,
               locals,
               scopes: ScopeTracker::new(env.storage.clone()),
               sessions,
               env }
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    // --- Locals ---

    /// Input inicial del flow.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T, CoreEngineError> {
        let v = self.locals.get(INPUT_LOCAL).cloned().unwrap_or(Value::Null);
        Ok(serde_json::from_value(v)?)
    }

    pub fn local<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CoreEngineError> {
        match self.locals.get(key) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    /// Guarda un local; se captura en el siguiente checkpoint.
    pub fn set_local<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), CoreEngineError> {
        if key == INPUT_LOCAL {
            return Err(CoreEngineError::Internal(format!("'{INPUT_LOCAL}' is reserved")));
        }
        self.locals.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    // --- Persistencia ---

    /// Ejecuta `body` dentro de una scope nueva. Al salir con éxito la scope
    /// se cierra (flush implícito) y queda pendiente del siguiente commit; si
    /// `body` falla, sus escrituras se descartan. Un error fatal de la scope
    /// (escrituras inconsistentes o reutilización tras rollback) se devuelve
    /// aunque `body` lo haya capturado.
    pub fn with_scope<T, F>(&mut self, body: F) -> Result<T, CoreEngineError>
        where F: FnOnce(&mut FlowContext) -> Result<T, CoreEngineError>
    {
        let id = self.scopes.open()?;
        let result = body(self);
        if let Some(fatal) = self.scopes.fatal().cloned() {
            self.scopes.abort();
            return Err(fatal);
        }
        let still_open = self.scopes.current() == Some(id);
        match result {
            Ok(v) => {
                if still_open {
                    self.scopes.close()?;
                }
                Ok(v)
            }
            Err(e) => {
                if still_open {
                    self.scopes.abort();
                }
                Err(e)
            }
        }
    }

    /// Abre una scope que permanece abierta hasta `close_scope` o hasta el
    /// siguiente punto de suspensión.
    pub fn open_scope(&mut self) -> Result<ScopeId, CoreEngineError> {
        self.scopes.open()
    }

    pub fn close_scope(&mut self) -> Result<(), CoreEngineError> {
        self.scopes.close()
    }

    pub fn persist<E: Entity>(&mut self, entity: &E) -> Result<(), CoreEngineError> {
        let row = entity.to_row()?;
        self.scopes.persist(row)
    }

    pub fn flush(&mut self) -> Result<(), CoreEngineError> {
        self.scopes.flush()
    }

    /// Entidades confirmadas de la tabla de `E` (sin las escrituras
    /// pendientes de este flow).
    pub fn committed<E: Entity>(&self) -> Result<Vec<E>, CoreEngineError> {
        self.env
            .storage
            .read_committed(E::TABLE)?
            .iter()
            .map(E::from_row)
            .collect()
    }

    // --- Sesiones ---

    pub fn initiate_session(&mut self, counterparty: &str) -> Result<SessionId, CoreEngineError> {
        self.sessions.initiate(self.env.transport.as_ref(), counterparty)
    }

    /// Mensaje entregado al reanudar tras `Suspension::Receive`.
    pub fn received(&mut self, session: SessionId) -> Result<Value, CoreEngineError> {
        self.sessions.take_received(session)
    }

    pub fn received_as<T: DeserializeOwned>(&mut self, session: SessionId) -> Result<T, CoreEngineError> {
        Ok(serde_json::from_value(self.received(session)?)?)
    }

    // --- Servicios ---

    pub fn sign(&self, tx: &ProposedTransaction) -> Result<Signature, CoreEngineError> {
        Ok(self.env.services.signer.sign(&tx.signing_bytes()?))
    }

    /// Rechazos de negocio llegan como `ContractRejected` capturable.
    pub fn verify(&self, tx: &ProposedTransaction) -> Result<(), CoreEngineError> {
        self.env.services.verifier.verify(tx)?;
        Ok(())
    }
}
