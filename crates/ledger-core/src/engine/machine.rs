//! Máquina de estados de un flow.
//!
//! Ejecuta steps en orden sobre un `FlowContext` hasta el siguiente punto de
//! suspensión o hasta completar. Cada punto de suspensión confirma, en una
//! única transacción, las scopes del intervalo y el nuevo checkpoint
//! (compare-and-set sobre el anterior). Al completar, las escrituras
//! pendientes se confirman junto con la eliminación del checkpoint.
//!
//! La máquina no espera: devuelve la condición de espera al driver del
//! scheduler, que la cumple y vuelve a invocar `run_interval`.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use serde_json::{Map, Value};

use super::flow_ctx::{FlowContext, FlowEnv};
use crate::checkpoint::CheckpointStore;
use crate::constants::INPUT_LOCAL;
use crate::errors::CoreEngineError;
use crate::model::{Checkpoint, CheckpointDraft, FlowId, OutboundMessage, ResumePoint, SessionId, WaitCondition};
use crate::repo::FlowDefinition;
use crate::session::{Inbound, SessionMessenger};
use crate::step::{StepRunResult, Suspension};

/// Evento con el que se reanuda un intervalo.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeEvent {
    /// Espera cumplida (inicio, sleep vencido, checkpoint explícito, send).
    Wake,
    Message { session: SessionId, payload: Value },
    ReceiveTimedOut { session: SessionId },
}

/// Resultado de un intervalo ejecutado con éxito.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// Checkpoint confirmado; el driver debe transmitir su outbox y cumplir
    /// su condición de espera.
    Suspended(Checkpoint),
    Completed(Value),
}

pub struct FlowStateMachine {
    definition: Arc<FlowDefinition>,
    ctx: FlowContext,
    store: CheckpointStore,
    cursor: usize,
    seq: Option<u64>,
}

impl FlowStateMachine {
    /// Máquina para un flow nuevo; nada es durable hasta `begin`.
    pub fn new(definition: Arc<FlowDefinition>, flow_id: FlowId, input: Value, env: FlowEnv) -> Self {
        let mut locals = Map::new();
        locals.insert(INPUT_LOCAL.to_string(), input);
        let store = CheckpointStore::new(env.storage.clone());
        Self { definition,
               ctx: FlowContext::new(flow_id, locals, SessionMessenger::default(), env),
               store,
               cursor: 0,
               seq: None }
    }

    /// Reconstruye la máquina en el punto de reanudación de `checkpoint`.
    pub fn from_checkpoint(definition: Arc<FlowDefinition>, checkpoint: &Checkpoint, env: FlowEnv) -> Result<Self, CoreEngineError> {
        checkpoint.verify()?;
        if checkpoint.definition_hash != definition.definition_hash {
            return Err(CoreEngineError::DefinitionMismatch { expected: definition.definition_hash.clone(),
                                                             found: checkpoint.definition_hash.clone() });
        }
        let cursor = checkpoint.resume_point.step_index;
        if cursor > definition.len() || definition.step_id(cursor) != checkpoint.resume_point.step_id {
            return Err(CoreEngineError::UnknownStep(checkpoint.resume_point.step_id.clone()));
        }
        let store = CheckpointStore::new(env.storage.clone());
        let sessions = SessionMessenger::from_snapshot(checkpoint.sessions.clone());
        Ok(Self { definition,
                  ctx: FlowContext::new(checkpoint.flow_id, checkpoint.locals.clone(), sessions, env),
                  store,
                  cursor,
                  seq: Some(checkpoint.seq) })
    }

    pub fn flow_id(&self) -> FlowId {
        self.ctx.flow_id()
    }

    pub fn definition(&self) -> &Arc<FlowDefinition> {
        &self.definition
    }

    /// Secuencia del último checkpoint confirmado por esta máquina.
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Confirma el checkpoint inicial (`seq = 0`).
    pub fn begin(&mut self) -> Result<Checkpoint, CoreEngineError> {
        if self.seq.is_some() {
            return Err(CoreEngineError::Internal(format!("flow {} already started", self.flow_id())));
        }
        let cp = self.draft(0, self.cursor, WaitCondition::Immediate, Vec::new())?;
        let store = self.store.clone();
        self.ctx.scopes.commit_with(|txn| store.save(txn, &cp, None))?;
        self.seq = Some(0);
        info!("flow:start flow_id={} name={}", self.flow_id(), self.definition.name);
        Ok(cp)
    }

    /// Ejecuta steps hasta el siguiente punto de suspensión o el final. Si
    /// devuelve error, nada de este intervalo es durable y la máquina debe
    /// descartarse (el flow se reanuda desde su último checkpoint).
    pub fn run_interval(&mut self, event: ResumeEvent) -> Result<Advance, CoreEngineError> {
        let result = self.run_steps(event);
        if let Err(e) = &result {
            warn!("flow:interval_failed flow_id={} step={} err={}",
                  self.flow_id(),
                  self.definition.step_id(self.cursor),
                  e);
            self.ctx.scopes.abandon();
            self.ctx.sessions.clear_inbound();
        }
        result
    }

    fn run_steps(&mut self, event: ResumeEvent) -> Result<Advance, CoreEngineError> {
        let prev = self.seq
                       .ok_or_else(|| CoreEngineError::Internal(format!("flow {} not started", self.flow_id())))?;
        match event {
            ResumeEvent::Wake => {}
            ResumeEvent::Message { session, payload } => {
                self.ctx.sessions.accept(Inbound::Message { session, payload })?
            }
            ResumeEvent::ReceiveTimedOut { session } => self.ctx.sessions.accept(Inbound::TimedOut { session })?,
        }

        loop {
            if self.cursor >= self.definition.len() {
                return self.complete(prev, Value::Null);
            }
            let definition = self.definition.clone();
            let step = &definition.steps[self.cursor];
            debug!("step:start flow_id={} step={}", self.flow_id(), step.id());
            let outcome = step.run(&mut self.ctx);
            if let Some(fatal) = self.ctx.scopes.take_fatal() {
                return Err(fatal);
            }
            match outcome? {
                StepRunResult::Continue => self.cursor += 1,
                StepRunResult::Goto(id) => self.cursor = definition.index_of(&id)?,
                StepRunResult::Suspend(s) => return self.suspend(prev, s),
                StepRunResult::Complete(v) => return self.complete(prev, v),
            }
        }
    }

    fn suspend(&mut self, prev: u64, suspension: Suspension) -> Result<Advance, CoreEngineError> {
        self.ctx.scopes.prepare_suspend()?;
        let now = Utc::now();
        let (wait, outbox) = match suspension {
            Suspension::Sleep(d) => (WaitCondition::Sleep { until: deadline_after(now, d) }, Vec::new()),
            Suspension::Send { session, payload } => {
                (WaitCondition::Immediate, vec![self.ctx.sessions.prepare_send(session, payload)?])
            }
            Suspension::Receive { session, timeout } => {
                self.ctx.sessions.ensure_known(session)?;
                let deadline = timeout.map(|t| deadline_after(now, t));
                (WaitCondition::Receive { session, deadline }, Vec::new())
            }
            Suspension::Checkpoint => (WaitCondition::Immediate, Vec::new()),
        };
        self.ctx.sessions.clear_inbound();
        let next = self.cursor + 1;
        let cp = self.draft(prev + 1, next, wait, outbox)?;
        let store = self.store.clone();
        self.ctx.scopes.commit_with(|txn| store.save(txn, &cp, Some(prev)))?;
        self.seq = Some(cp.seq);
        self.cursor = next;
        debug!("flow:suspend flow_id={} seq={} resume={}",
               cp.flow_id,
               cp.seq,
               cp.resume_point.step_id);
        Ok(Advance::Suspended(cp))
    }

    fn complete(&mut self, seq: u64, result: Value) -> Result<Advance, CoreEngineError> {
        self.ctx.scopes.prepare_suspend()?;
        let flow_id = self.flow_id();
        let store = self.store.clone();
        self.ctx.scopes.commit_with(|txn| store.delete(txn, flow_id, seq))?;
        self.cursor = self.definition.len();
        info!("flow:done flow_id={} seq={}", flow_id, seq);
        Ok(Advance::Completed(result))
    }

    fn draft(&self, seq: u64, cursor: usize, wait: WaitCondition, outbox: Vec<OutboundMessage>) -> Result<Checkpoint, CoreEngineError> {
        CheckpointDraft { flow_id: self.flow_id(),
                          seq,
                          flow_name: self.definition.name.clone(),
                          definition_hash: self.definition.definition_hash.clone(),
                          resume_point: ResumePoint { step_index: cursor,
                                                      step_id: self.definition.step_id(cursor).to_string() },
                          locals: self.ctx.locals.clone(),
                          sessions: self.ctx.sessions.snapshot(),
                          wait,
                          outbox }.seal()
    }
}

/// Instante `now + d`. Las esperas que no caben en el calendario quedan en
/// el último segundo del año 9999 (en la práctica, esperar indefinidamente).
pub(crate) fn deadline_after(now: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    let horizon = far_future();
    chrono::Duration::from_std(d).ok()
                                 .and_then(|delta| now.checked_add_signed(delta))
                                 .map(|t| t.min(horizon))
                                 .unwrap_or(horizon)
}

fn far_future() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31).and_then(|d| d.and_hms_opt(23, 59, 59))
                                         .map(|n| n.and_utc())
                                         .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn short_waits_are_exact() {
        let now = Utc::now();
        assert_eq!(deadline_after(now, Duration::from_millis(1500)), now + chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn huge_waits_are_clamped() {
        let now = Utc::now();
        let horizon = far_future();
        assert_eq!(deadline_after(now, Duration::from_secs(400_000 * 365 * 86_400)), horizon);
        assert_eq!(deadline_after(now, Duration::MAX), horizon);
    }
}
