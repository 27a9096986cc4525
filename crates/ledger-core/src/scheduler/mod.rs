//! Flow scheduler: conjunto de flows vivos, entrega de eventos de
//! reanudación, límite de concurrencia y superficie de operador.
//!
//! Cada flow tiene un driver propio (tarea tokio) con un canal de señales;
//! las esperas (sleep, receive, backoff, observación) no ocupan worker. Los
//! intervalos se ejecutan en el pool bloqueante con un permiso del semáforo
//! de `max_workers`.

mod config;
mod driver;

pub use config::SchedulerConfig;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use indexmap::IndexMap;
use log::{error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::checkpoint::CheckpointStore;
use crate::engine::{FlowEnv, FlowStateMachine};
use crate::errors::CoreEngineError;
use crate::hospital::{FlowHospital, HospitalOutcome, HospitalRecord};
use crate::model::{FlowId, ResumePoint, SessionId};
use crate::repo::{FlowDefinition, FlowRegistry};
use crate::services::ServiceHub;
use crate::session::{Envelope, Transport};
use crate::storage::StorageEngine;
use driver::{FlowDriver, FlowSignal, Phase};

/// Estado observable de un flow.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowStatus {
    Running,
    Sleeping,
    AwaitingMessage,
    Retrying { attempt: u32 },
    Observation,
    Completed,
    Failed(String),
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Failed(_))
    }
}

/// Resultado final de un flow.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    Completed(Value),
    Failed(String),
}

struct FlowHandle {
    signals: mpsc::Sender<FlowSignal>,
    status: watch::Receiver<FlowStatus>,
    outcome: watch::Receiver<Option<FlowOutcome>>,
}

pub(crate) struct Inner {
    pub(crate) env: FlowEnv,
    pub(crate) checkpoints: CheckpointStore,
    pub(crate) hospital: Arc<FlowHospital>,
    pub(crate) sessions: DashMap<SessionId, FlowId>,
    pub(crate) workers: Arc<Semaphore>,
    registry: FlowRegistry,
    flows: DashMap<FlowId, FlowHandle>,
    /// Resultados de flows terminados, en orden de llegada y acotados por
    /// `finished_capacity`.
    finished: Mutex<IndexMap<FlowId, FlowOutcome>>,
    config: SchedulerConfig,
}

impl Inner {
    /// Retira el handle de un flow cuyo driver terminó. El resultado se
    /// publica antes de quitar el handle.
    pub(crate) fn retire(&self, flow_id: FlowId, outcome: Option<FlowOutcome>) {
        if let Some(outcome) = outcome {
            match self.finished.lock() {
                Ok(mut finished) => {
                    finished.insert(flow_id, outcome);
                    while finished.len() > self.config.finished_capacity.max(1) {
                        finished.shift_remove_index(0);
                    }
                }
                Err(_) => error!("scheduler:retire flow_id={} finished table poisoned", flow_id),
            }
        }
        self.flows.remove(&flow_id);
    }

    fn finished_outcome(&self, flow_id: FlowId) -> Option<FlowOutcome> {
        self.finished.lock().ok().and_then(|f| f.get(&flow_id).cloned())
    }
}

#[derive(Clone)]
pub struct FlowScheduler {
    inner: Arc<Inner>,
}

fn join_error(e: tokio::task::JoinError) -> CoreEngineError {
    CoreEngineError::Internal(format!("blocking task failed: {e}"))
}

impl FlowScheduler {
    pub fn new(storage: Arc<dyn StorageEngine>, transport: Arc<dyn Transport>, services: ServiceHub, config: SchedulerConfig) -> Self {
        let hospital = Arc::new(FlowHospital::with_storage(config.hospital.clone(), storage.clone()));
        let inner = Inner { env: FlowEnv::new(storage.clone(), transport, services),
                            checkpoints: CheckpointStore::new(storage),
                            hospital,
                            sessions: DashMap::new(),
                            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
                            registry: FlowRegistry::new(),
                            flows: DashMap::new(),
                            finished: Mutex::new(IndexMap::new()),
                            config };
        Self { inner: Arc::new(inner) }
    }

    pub fn hospital(&self) -> &Arc<FlowHospital> {
        &self.inner.hospital
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Registra una definición para poder reanudar sus flows tras reinicio.
    pub fn register(&self, definition: Arc<FlowDefinition>) {
        self.inner.registry.register(definition);
    }

    /// Arranca un flow: confirma su checkpoint inicial y lanza su driver.
    pub async fn start(&self, definition: Arc<FlowDefinition>, input: Value) -> Result<FlowId, CoreEngineError> {
        match self.inner.registry.get(&definition.name) {
            Ok(existing) if existing.definition_hash != definition.definition_hash => {
                return Err(CoreEngineError::DefinitionMismatch { expected: existing.definition_hash.clone(),
                                                                 found: definition.definition_hash.clone() });
            }
            Ok(_) => {}
            Err(_) => self.register(definition.clone()),
        }
        let flow_id = FlowId::new();
        let mut machine = FlowStateMachine::new(definition.clone(), flow_id, input, self.inner.env.clone());
        let (machine, begun) = tokio::task::spawn_blocking(move || {
                                   let r = machine.begin();
                                   (machine, r)
                               }).await
                                 .map_err(join_error)?;
        let cp = begun?;
        let seq = cp.seq;
        self.spawn_driver(flow_id, definition, seq, Phase::Settle(cp, machine));
        Ok(flow_id)
    }

    /// Arranca un flow de una definición ya registrada.
    pub async fn start_registered(&self, name: &str, input: Value) -> Result<FlowId, CoreEngineError> {
        let definition = self.inner.registry.get(name)?;
        self.start(definition, input).await
    }

    fn spawn_driver(&self, flow_id: FlowId, definition: Arc<FlowDefinition>, durable_seq: u64, initial: Phase) {
        let (tx, rx) = mpsc::channel(self.inner.config.signal_buffer.max(1));
        let (status_tx, status_rx) = watch::channel(FlowStatus::Running);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        self.inner.flows.insert(flow_id,
                                FlowHandle { signals: tx,
                                             status: status_rx,
                                             outcome: outcome_rx });
        let driver = FlowDriver { inner: self.inner.clone(),
                                  flow_id,
                                  definition,
                                  signals: rx,
                                  status: status_tx,
                                  outcome: outcome_tx,
                                  inbox: VecDeque::new(),
                                  durable_seq };
        tokio::spawn(driver.run(initial));
    }

    fn signal_sender(&self, flow_id: FlowId) -> Result<mpsc::Sender<FlowSignal>, CoreEngineError> {
        if let Some(h) = self.inner.flows.get(&flow_id) {
            return Ok(h.signals.clone());
        }
        match self.inner.finished_outcome(flow_id) {
            Some(_) => Err(CoreEngineError::FlowCompleted),
            None => Err(CoreEngineError::UnknownFlow(flow_id.to_string())),
        }
    }

    async fn signal(&self, flow_id: FlowId, signal: FlowSignal) -> Result<(), CoreEngineError> {
        let sender = self.signal_sender(flow_id)?;
        sender.send(signal).await.map_err(|_| CoreEngineError::FlowCompleted)
    }

    /// Llegada de un mensaje entrante: evento de reanudación del flow dueño
    /// de la sesión.
    pub async fn deliver(&self, session: SessionId, payload: Value) -> Result<(), CoreEngineError> {
        let flow_id = self.inner
                          .sessions
                          .get(&session)
                          .map(|e| *e.value())
                          .ok_or_else(|| CoreEngineError::UnknownSession(session.to_string()))?;
        self.signal(flow_id, FlowSignal::Deliver { session, payload }).await
    }

    /// Entrega bytes de cable (`Envelope`) recibidos del transporte.
    pub async fn deliver_bytes(&self, bytes: &[u8]) -> Result<(), CoreEngineError> {
        let envelope = Envelope::from_bytes(bytes)?;
        self.deliver(envelope.session, envelope.payload).await
    }

    /// Espera el resultado del flow. `Ok(None)` si vence `timeout` (el flow
    /// sigue reintentando, en observación o esperando).
    pub async fn await_outcome(&self, flow_id: FlowId, timeout: Duration) -> Result<Option<FlowOutcome>, CoreEngineError> {
        let Some(mut rx) = self.inner.flows.get(&flow_id).map(|h| h.outcome.clone()) else {
            return match self.inner.finished_outcome(flow_id) {
                Some(outcome) => Ok(Some(outcome)),
                None => Err(CoreEngineError::UnknownFlow(flow_id.to_string())),
            };
        };
        let waited = tokio::time::timeout(timeout, async move {
                         loop {
                             let current = rx.borrow_and_update().clone();
                             if current.is_some() {
                                 return current;
                             }
                             if rx.changed().await.is_err() {
                                 return rx.borrow().clone();
                             }
                         }
                     }).await;
        Ok(waited.unwrap_or(None))
    }

    pub fn status(&self, flow_id: FlowId) -> Option<FlowStatus> {
        if let Some(h) = self.inner.flows.get(&flow_id) {
            return Some(h.status.borrow().clone());
        }
        self.inner.finished_outcome(flow_id).map(|outcome| match outcome {
                                                 FlowOutcome::Completed(_) => FlowStatus::Completed,
                                                 FlowOutcome::Failed(reason) => FlowStatus::Failed(reason),
                                             })
    }

    /// Flows con driver vivo, incluidos los que están en observación.
    pub fn tracked_flows(&self) -> usize {
        self.inner.flows.len()
    }

    /// Flows con driver vivo (no terminales).
    pub fn live_flows(&self) -> Vec<FlowId> {
        self.inner
            .flows
            .iter()
            .filter(|e| !e.status.borrow().is_terminal())
            .map(|e| *e.key())
            .collect()
    }

    /// Cancela un flow en su siguiente frontera de suspensión.
    pub async fn cancel(&self, flow_id: FlowId) -> Result<(), CoreEngineError> {
        info!("scheduler:cancel flow_id={}", flow_id);
        self.signal(flow_id, FlowSignal::Cancel).await
    }

    /// Reconstruye todos los flows con checkpoint durable que no tengan
    /// driver en este proceso. Los que estaban en observación vuelven a
    /// observación sin reintentar.
    pub async fn recover(&self) -> Result<Vec<FlowId>, CoreEngineError> {
        let hospital = self.inner.hospital.clone();
        let store = self.inner.checkpoints.clone();
        let checkpoints = tokio::task::spawn_blocking(move || -> Result<_, CoreEngineError> {
                              hospital.restore()?;
                              store.list()
                          }).await
                            .map_err(join_error)??;

        let mut recovered = Vec::new();
        for cp in checkpoints {
            if self.inner.flows.contains_key(&cp.flow_id) {
                continue;
            }
            let definition = match self.inner.registry.get(&cp.flow_name) {
                Ok(d) => d,
                Err(e) => {
                    error!("scheduler:recover flow_id={} skipped: {}", cp.flow_id, e);
                    continue;
                }
            };
            let machine = match FlowStateMachine::from_checkpoint(definition.clone(), &cp, self.inner.env.clone()) {
                Ok(m) => m,
                Err(e) => {
                    error!("scheduler:recover flow_id={} skipped: {}", cp.flow_id, e);
                    continue;
                }
            };
            let observed = self.inner
                               .hospital
                               .record(cp.flow_id)
                               .map(|r| r.outcome == HospitalOutcome::Observation)
                               .unwrap_or(false);
            let flow_id = cp.flow_id;
            let seq = cp.seq;
            for s in &cp.sessions {
                self.inner.sessions.insert(s.session_id, flow_id);
            }
            let phase = if observed { Phase::Observe } else { Phase::Settle(cp, machine) };
            info!("scheduler:recover flow_id={} seq={} observation={}", flow_id, seq, observed);
            self.spawn_driver(flow_id, definition, seq, phase);
            recovered.push(flow_id);
        }
        Ok(recovered)
    }

    // --- Superficie de operador ---

    pub fn list_observation(&self) -> Vec<HospitalRecord> {
        self.inner.hospital.list_observation()
    }

    /// Alta forzada: el flow sale de observación y se reintenta desde su
    /// último checkpoint.
    pub async fn discharge(&self, flow_id: FlowId) -> Result<HospitalRecord, CoreEngineError> {
        let sender = self.signal_sender(flow_id)?;
        let record = self.inner.hospital.discharge(flow_id)?;
        if sender.send(FlowSignal::Discharge).await.is_err() {
            warn!("scheduler:discharge flow_id={} has no live driver", flow_id);
        }
        Ok(record)
    }

    /// Secuencia y punto de reanudación del último checkpoint durable.
    pub fn inspect(&self, flow_id: FlowId) -> Result<Option<(u64, ResumePoint)>, CoreEngineError> {
        self.inner.checkpoints.inspect(flow_id)
    }
}
