//! Driver de un flow: tarea tokio que alterna entre ejecutar intervalos (en
//! el pool bloqueante, con permiso del semáforo de workers) y cumplir las
//! esperas de cada checkpoint.
//!
//! Un único driver por flow garantiza que dos intervalos del mismo flow nunca
//! se ejecutan a la vez y que hay a lo sumo un commit de checkpoint en vuelo.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use super::{FlowOutcome, FlowStatus, Inner};
use crate::engine::machine::deadline_after;
use crate::engine::{Advance, FlowStateMachine, ResumeEvent};
use crate::errors::CoreEngineError;
use crate::hospital::Diagnosis;
use crate::model::{Checkpoint, FlowId, OutboundMessage, SessionId, WaitCondition};
use crate::repo::FlowDefinition;
use crate::session::{Envelope, SessionHandle};

/// Señales que el scheduler envía al driver de un flow.
#[derive(Debug)]
pub(crate) enum FlowSignal {
    Deliver { session: SessionId, payload: Value },
    Discharge,
    Cancel,
}

/// Fase siguiente del driver.
pub(crate) enum Phase {
    /// Checkpoint confirmado: transmitir outbox y cumplir la espera.
    Settle(Checkpoint, FlowStateMachine),
    Run(FlowStateMachine, ResumeEvent),
    Failed(CoreEngineError),
    /// En observación hasta alta manual o cancelación.
    Observe,
    Done,
}

enum Woken {
    Timer,
    Message(Value),
    Cancel,
    Shutdown,
}

pub(crate) struct FlowDriver {
    pub(crate) inner: Arc<Inner>,
    pub(crate) flow_id: FlowId,
    pub(crate) definition: Arc<FlowDefinition>,
    pub(crate) signals: mpsc::Receiver<FlowSignal>,
    pub(crate) status: watch::Sender<FlowStatus>,
    pub(crate) outcome: watch::Sender<Option<FlowOutcome>>,
    /// Mensajes entrantes aún no consumidos, FIFO por llegada. Sobrevive a
    /// los reintentos.
    pub(crate) inbox: VecDeque<(SessionId, Value)>,
    /// Secuencia del último checkpoint durable conocido.
    pub(crate) durable_seq: u64,
}

impl FlowDriver {
    pub(crate) async fn run(mut self, initial: Phase) {
        let mut phase = initial;
        loop {
            phase = match phase {
                Phase::Settle(cp, machine) => self.settle(cp, machine).await,
                Phase::Run(machine, event) => self.run_interval(machine, event).await,
                Phase::Failed(err) => self.triage(err).await,
                Phase::Observe => self.observe().await,
                Phase::Done => break,
            };
        }
        let flow_id = self.flow_id;
        self.inner.sessions.retain(|_, owner| *owner != flow_id);
        let outcome = self.outcome.borrow().clone();
        self.inner.retire(flow_id, outcome);
        debug!("driver:exit flow_id={}", flow_id);
    }

    fn set_status(&self, status: FlowStatus) {
        self.status.send_replace(status);
    }

    async fn settle(&mut self, cp: Checkpoint, machine: FlowStateMachine) -> Phase {
        self.durable_seq = cp.seq;
        for s in &cp.sessions {
            self.inner.sessions.insert(s.session_id, self.flow_id);
        }
        for msg in &cp.outbox {
            if let Err(e) = self.transmit(msg).await {
                return Phase::Failed(e);
            }
        }
        match cp.wait {
            WaitCondition::Immediate => {
                if self.cancel_requested() {
                    return self.cancel().await;
                }
                Phase::Run(machine, ResumeEvent::Wake)
            }
            WaitCondition::Sleep { until } => {
                self.set_status(FlowStatus::Sleeping);
                match self.wait(Some(until), None).await {
                    Woken::Timer | Woken::Message(_) => Phase::Run(machine, ResumeEvent::Wake),
                    Woken::Cancel => self.cancel().await,
                    Woken::Shutdown => Phase::Done,
                }
            }
            WaitCondition::Receive { session, deadline } => {
                if let Some(payload) = self.take_inbox(session) {
                    return Phase::Run(machine, ResumeEvent::Message { session, payload });
                }
                self.set_status(FlowStatus::AwaitingMessage);
                match self.wait(deadline, Some(session)).await {
                    Woken::Timer => Phase::Run(machine, ResumeEvent::ReceiveTimedOut { session }),
                    Woken::Message(payload) => Phase::Run(machine, ResumeEvent::Message { session, payload }),
                    Woken::Cancel => self.cancel().await,
                    Woken::Shutdown => Phase::Done,
                }
            }
        }
    }

    async fn transmit(&self, msg: &OutboundMessage) -> Result<(), CoreEngineError> {
        let envelope = Envelope { flow_id: self.flow_id,
                                  session: msg.session,
                                  seq: msg.seq,
                                  payload: msg.payload.clone() };
        let handle = SessionHandle { session: msg.session,
                                     counterparty: msg.counterparty.clone() };
        self.inner.env.transport.send(&handle, envelope.to_bytes()?).await?;
        debug!("driver:sent flow_id={} session={} seq={}", self.flow_id, msg.session, msg.seq);
        Ok(())
    }

    async fn run_interval(&mut self, machine: FlowStateMachine, event: ResumeEvent) -> Phase {
        self.set_status(FlowStatus::Running);
        let permit = match self.inner.workers.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return Phase::Done,
        };
        let mut machine = machine;
        let ev = event.clone();
        let joined = tokio::task::spawn_blocking(move || {
                         let result = machine.run_interval(ev);
                         (machine, result)
                     }).await;
        drop(permit);
        match joined {
            Ok((_, Ok(Advance::Completed(value)))) => {
                self.complete(value);
                Phase::Done
            }
            Ok((machine, Ok(Advance::Suspended(cp)))) => Phase::Settle(cp, machine),
            Ok((_, Err(e))) => {
                self.put_back(event);
                Phase::Failed(e)
            }
            Err(join) => {
                self.put_back(event);
                Phase::Failed(CoreEngineError::Internal(format!("flow step panicked: {join}")))
            }
        }
    }

    /// Un mensaje consumido por un intervalo fallido vuelve al frente.
    fn put_back(&mut self, event: ResumeEvent) {
        if let ResumeEvent::Message { session, payload } = event {
            self.inbox.push_front((session, payload));
        }
    }

    fn take_inbox(&mut self, session: SessionId) -> Option<Value> {
        let pos = self.inbox.iter().position(|(s, _)| *s == session)?;
        self.inbox.remove(pos).map(|(_, payload)| payload)
    }

    async fn triage(&mut self, err: CoreEngineError) -> Phase {
        match self.inner.hospital.admit(self.flow_id, &err) {
            Diagnosis::DischargeAndRetry { delay } => {
                let attempt = self.inner
                                  .hospital
                                  .record(self.flow_id)
                                  .map(|r| r.attempt_count)
                                  .unwrap_or(1);
                self.set_status(FlowStatus::Retrying { attempt });
                let until = deadline_after(Utc::now(), delay);
                match self.wait(Some(until), None).await {
                    Woken::Timer | Woken::Message(_) => self.reload().await,
                    Woken::Cancel => self.cancel().await,
                    Woken::Shutdown => Phase::Done,
                }
            }
            Diagnosis::KeepForObservation => Phase::Observe,
            Diagnosis::PermanentFailure => {
                self.remove_checkpoint().await;
                self.fail(err.to_string());
                Phase::Done
            }
        }
    }

    async fn observe(&mut self) -> Phase {
        self.set_status(FlowStatus::Observation);
        info!("driver:observation flow_id={}", self.flow_id);
        loop {
            match self.signals.recv().await {
                Some(FlowSignal::Discharge) => return self.reload().await,
                Some(FlowSignal::Cancel) => return self.cancel().await,
                Some(FlowSignal::Deliver { session, payload }) => self.inbox.push_back((session, payload)),
                None => return Phase::Done,
            }
        }
    }

    /// Reconstruye la máquina desde el último checkpoint durable.
    async fn reload(&mut self) -> Phase {
        let store = self.inner.checkpoints.clone();
        let env = self.inner.env.clone();
        let definition = self.definition.clone();
        let flow_id = self.flow_id;
        let loaded = tokio::task::spawn_blocking(move || -> Result<Option<(Checkpoint, FlowStateMachine)>, CoreEngineError> {
                         let Some(cp) = store.load(flow_id)? else {
                             return Ok(None);
                         };
                         let machine = FlowStateMachine::from_checkpoint(definition, &cp, env)?;
                         Ok(Some((cp, machine)))
                     }).await;
        match loaded {
            Ok(Ok(Some((cp, machine)))) => {
                debug!("driver:reload flow_id={} seq={}", flow_id, cp.seq);
                Phase::Settle(cp, machine)
            }
            Ok(Ok(None)) => {
                warn!("driver:reload flow_id={} has no checkpoint", flow_id);
                self.fail("checkpoint missing".into());
                Phase::Done
            }
            Ok(Err(e)) => Phase::Failed(e),
            Err(join) => Phase::Failed(CoreEngineError::Internal(format!("checkpoint reload panicked: {join}"))),
        }
    }

    /// Espera hasta `deadline` (si hay) o hasta una señal relevante. Los
    /// mensajes de otras sesiones se encolan.
    async fn wait(&mut self, deadline: Option<DateTime<Utc>>, session: Option<SessionId>) -> Woken {
        let at = deadline.and_then(|d| Instant::now().checked_add((d - Utc::now()).to_std().unwrap_or(Duration::ZERO)));
        loop {
            let signal = match at {
                Some(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => return Woken::Timer,
                        s = self.signals.recv() => s,
                    }
                }
                None => self.signals.recv().await,
            };
            match signal {
                Some(FlowSignal::Deliver { session: s, payload }) => {
                    if Some(s) == session {
                        return Woken::Message(payload);
                    }
                    self.inbox.push_back((s, payload));
                }
                Some(FlowSignal::Cancel) => return Woken::Cancel,
                Some(FlowSignal::Discharge) => {}
                None => return Woken::Shutdown,
            }
        }
    }

    /// Revisa señales pendientes sin esperar; encola mensajes.
    fn cancel_requested(&mut self) -> bool {
        let mut cancel = false;
        while let Ok(signal) = self.signals.try_recv() {
            match signal {
                FlowSignal::Deliver { session, payload } => self.inbox.push_back((session, payload)),
                FlowSignal::Cancel => cancel = true,
                FlowSignal::Discharge => {}
            }
        }
        cancel
    }

    async fn cancel(&mut self) -> Phase {
        info!("driver:cancel flow_id={} seq={}", self.flow_id, self.durable_seq);
        self.remove_checkpoint().await;
        self.inner.hospital.flow_completed(self.flow_id);
        self.fail("cancelled".into());
        Phase::Done
    }

    async fn remove_checkpoint(&self) {
        let storage = self.inner.env.storage.clone();
        let store = self.inner.checkpoints.clone();
        let (flow_id, seq) = (self.flow_id, self.durable_seq);
        let removed = tokio::task::spawn_blocking(move || -> Result<(), CoreEngineError> {
                          let mut txn = storage.begin()?;
                          store.delete(txn.as_mut(), flow_id, seq)?;
                          txn.commit()?;
                          Ok(())
                      }).await;
        match removed {
            Ok(Ok(())) => debug!("driver:checkpoint_removed flow_id={} seq={}", flow_id, seq),
            Ok(Err(e)) => error!("driver:checkpoint_remove_failed flow_id={} err={}", flow_id, e),
            Err(join) => error!("driver:checkpoint_remove_failed flow_id={} err={}", flow_id, join),
        }
    }

    fn complete(&self, value: Value) {
        self.inner.hospital.flow_completed(self.flow_id);
        self.outcome.send_replace(Some(FlowOutcome::Completed(value)));
        self.set_status(FlowStatus::Completed);
    }

    fn fail(&self, reason: String) {
        warn!("driver:failed flow_id={} reason={}", self.flow_id, reason);
        self.outcome.send_replace(Some(FlowOutcome::Failed(reason.clone())));
        self.set_status(FlowStatus::Failed(reason));
    }
}
