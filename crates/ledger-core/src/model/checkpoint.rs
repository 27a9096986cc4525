//! Snapshot inmutable del estado suspendido de un flow.
//!
//! Un checkpoint nunca se muta: el siguiente punto de suspensión produce uno
//! nuevo con `seq + 1` que lo reemplaza en el store dentro de la misma
//! transacción que confirma las escrituras del intervalo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::ids::{FlowId, SessionId};
use crate::constants::ENGINE_VERSION;
use crate::errors::CoreEngineError;
use crate::hashing::hash_value;
use crate::session::FlowSession;

/// Punto de reanudación: índice e id del step que se ejecutará al reanudar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub step_index: usize,
    pub step_id: String,
}

/// Condición que el flow espera en el punto de suspensión. Las fechas son
/// absolutas para poder rearmarlas tras un reinicio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WaitCondition {
    /// Reanudar inmediatamente (checkpoint explícito, send ya confirmado).
    Immediate,
    Sleep { until: DateTime<Utc> },
    Receive { session: SessionId, deadline: Option<DateTime<Utc>> },
}

/// Mensaje saliente registrado en el checkpoint para (re)transmisión.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub session: SessionId,
    pub counterparty: String,
    pub seq: u64,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub flow_id: FlowId,
    pub seq: u64,
    pub flow_name: String,
    pub definition_hash: String,
    pub resume_point: ResumePoint,
    pub locals: Map<String, Value>,
    pub sessions: Vec<FlowSession>,
    pub wait: WaitCondition,
    pub outbox: Vec<OutboundMessage>,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>, // metadato (no entra en fingerprint)
}

/// Insumos de un checkpoint antes de calcular su fingerprint.
pub struct CheckpointDraft {
    pub flow_id: FlowId,
    pub seq: u64,
    pub flow_name: String,
    pub definition_hash: String,
    pub resume_point: ResumePoint,
    pub locals: Map<String, Value>,
    pub sessions: Vec<FlowSession>,
    pub wait: WaitCondition,
    pub outbox: Vec<OutboundMessage>,
}

impl CheckpointDraft {
    pub fn seal(self) -> Result<Checkpoint, CoreEngineError> {
        let mut cp = Checkpoint { flow_id: self.flow_id,
                                  seq: self.seq,
                                  flow_name: self.flow_name,
                                  definition_hash: self.definition_hash,
                                  resume_point: self.resume_point,
                                  locals: self.locals,
                                  sessions: self.sessions,
                                  wait: self.wait,
                                  outbox: self.outbox,
                                  fingerprint: String::new(),
                                  created_at: Utc::now() };
        cp.fingerprint = cp.compute_fingerprint()?;
        Ok(cp)
    }
}

impl Checkpoint {
    fn compute_fingerprint(&self) -> Result<String, CoreEngineError> {
        let body = json!({
            "engine_version": ENGINE_VERSION,
            "flow_id": self.flow_id,
            "seq": self.seq,
            "flow_name": self.flow_name,
            "definition_hash": self.definition_hash,
            "resume_point": serde_json::to_value(&self.resume_point)?,
            "locals": Value::Object(self.locals.clone()),
            "sessions": serde_json::to_value(&self.sessions)?,
            "wait": serde_json::to_value(&self.wait)?,
            "outbox": serde_json::to_value(&self.outbox)?,
        });
        Ok(hash_value(&body))
    }

    /// Verifica que el contenido coincide con el fingerprint sellado.
    pub fn verify(&self) -> Result<(), CoreEngineError> {
        if self.compute_fingerprint()? != self.fingerprint {
            return Err(CoreEngineError::CheckpointCorrupted(self.flow_id.to_string()));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Value, CoreEngineError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: Value) -> Result<Self, CoreEngineError> {
        let cp: Checkpoint = serde_json::from_value(value)?;
        cp.verify()?;
        Ok(cp)
    }
}
