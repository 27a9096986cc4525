//! Flow hospital: triage de errores que escapan de la lógica de un flow.
//!
//! Cada ocurrencia pasa por ANALYZING (clasificación + `decide`) y termina
//! en alta con reintento, observación o fallo permanente. El contador de
//! intentos de un flow sólo lo muta el driver que atiende ese flow, así que
//! el `DashMap` basta como sincronización.
//!
//! Los observadores se suscriben con `subscribe()` en lugar de registrar
//! callbacks globales.

mod policy;
mod record;

pub use policy::{decide, Diagnosis, HospitalPolicy, Treatment};
pub use record::{HospitalEvent, HospitalOutcome, HospitalRecord};

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::{info, warn};
use tokio::sync::broadcast;

use crate::errors::{classify_error, CoreEngineError};
use crate::model::FlowId;
use crate::storage::StorageEngine;

const EVENT_CAPACITY: usize = 256;

pub struct FlowHospital {
    policy: HospitalPolicy,
    records: DashMap<FlowId, HospitalRecord>,
    events: broadcast::Sender<HospitalEvent>,
    storage: Option<Arc<dyn StorageEngine>>,
}

impl FlowHospital {
    pub fn new(policy: HospitalPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { policy,
               records: DashMap::new(),
               events,
               storage: None }
    }

    /// Hospital cuyos registros se replican en el storage engine.
    pub fn with_storage(policy: HospitalPolicy, storage: Arc<dyn StorageEngine>) -> Self {
        let mut hospital = Self::new(policy);
        hospital.storage = Some(storage);
        hospital
    }

    pub fn policy(&self) -> &HospitalPolicy {
        &self.policy
    }

    /// Recarga los registros persistidos (arranque tras reinicio).
    pub fn restore(&self) -> Result<usize, CoreEngineError> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let records = storage.hospital_records()?;
        let n = records.len();
        for r in records {
            self.records.insert(r.flow_id, r);
        }
        Ok(n)
    }

    /// Admite una ocurrencia de error para `flow_id` y devuelve el
    /// diagnóstico.
    pub fn admit(&self, flow_id: FlowId, error: &CoreEngineError) -> Diagnosis {
        let class = classify_error(error);
        let attempt = self.records
                          .get(&flow_id)
                          .map(|r| r.attempt_count + 1)
                          .unwrap_or(1);
        let diagnosis = decide(&self.policy, class, attempt);
        let outcome = match diagnosis {
            Diagnosis::DischargeAndRetry { .. } => HospitalOutcome::Discharged,
            Diagnosis::KeepForObservation => HospitalOutcome::Observation,
            Diagnosis::PermanentFailure => HospitalOutcome::Permanent,
        };
        info!("hospital:admit flow_id={} class={} attempt={} outcome={}",
              flow_id,
              class.as_str(),
              attempt,
              outcome.as_str());

        let record = HospitalRecord { flow_id,
                                      error_class: class,
                                      attempt_count: attempt,
                                      outcome,
                                      last_error: error.clone(),
                                      updated_at: Utc::now() };
        if outcome == HospitalOutcome::Permanent {
            self.records.remove(&flow_id);
            self.unmirror(flow_id);
        } else {
            self.mirror(&record);
            self.records.insert(flow_id, record);
        }
        self.publish(HospitalEvent { flow_id,
                                     outcome,
                                     attempt,
                                     error: error.clone() });
        diagnosis
    }

    /// Limpia el registro de un flow que completó.
    pub fn flow_completed(&self, flow_id: FlowId) {
        if self.records.remove(&flow_id).is_some() {
            self.unmirror(flow_id);
        }
    }

    pub fn record(&self, flow_id: FlowId) -> Option<HospitalRecord> {
        self.records.get(&flow_id).map(|r| r.clone())
    }

    /// Flows en observación, ordenados por última actualización.
    pub fn list_observation(&self) -> Vec<HospitalRecord> {
        let mut out: Vec<HospitalRecord> = self.records
                                               .iter()
                                               .filter(|r| r.outcome == HospitalOutcome::Observation)
                                               .map(|r| r.clone())
                                               .collect();
        out.sort_by_key(|r| r.updated_at);
        out
    }

    /// Alta manual: saca al flow de observación con presupuesto de
    /// reintentos nuevo.
    pub fn discharge(&self, flow_id: FlowId) -> Result<HospitalRecord, CoreEngineError> {
        let mut entry = self.records
                            .get_mut(&flow_id)
                            .ok_or_else(|| CoreEngineError::UnknownFlow(flow_id.to_string()))?;
        if entry.outcome != HospitalOutcome::Observation {
            return Err(CoreEngineError::Internal(format!("flow {flow_id} is not under observation")));
        }
        entry.outcome = HospitalOutcome::Discharged;
        entry.attempt_count = 0;
        entry.updated_at = Utc::now();
        let record = entry.clone();
        drop(entry);
        info!("hospital:discharge flow_id={}", flow_id);
        self.mirror(&record);
        self.publish(HospitalEvent { flow_id,
                                     outcome: HospitalOutcome::Discharged,
                                     attempt: 0,
                                     error: record.last_error.clone() });
        Ok(record)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HospitalEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: HospitalEvent) {
        // sin suscriptores: el evento se descarta
        let _ = self.events.send(event);
    }

    fn mirror(&self, record: &HospitalRecord) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.upsert_hospital_record(record) {
                warn!("hospital:mirror failed flow_id={} err={}", record.flow_id, e);
            }
        }
    }

    fn unmirror(&self, flow_id: FlowId) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove_hospital_record(flow_id) {
                warn!("hospital:unmirror failed flow_id={} err={}", flow_id, e);
            }
        }
    }
}

impl Default for FlowHospital {
    fn default() -> Self {
        Self::new(HospitalPolicy::default())
    }
}
