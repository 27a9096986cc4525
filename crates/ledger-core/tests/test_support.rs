#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ledger_core::{Entity, FlowId, FlowScheduler, FlowStatus, HospitalPolicy, InMemoryStorageEngine, InMemoryTransport,
                  SchedulerConfig, ServiceHub};
use serde::{Deserialize, Serialize};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: u32,
    pub text: String,
}

impl Entity for Note {
    const TABLE: &'static str = "custom_table";

    fn primary_key(&self) -> String {
        self.id.to_string()
    }
}

pub fn note(id: u32, text: &str) -> Note {
    Note { id,
           text: text.to_string() }
}

/// Política con backoff corto para que los reintentos no alarguen los tests.
pub fn fast_policy() -> HospitalPolicy {
    HospitalPolicy::default().with_backoff(Duration::from_millis(1), Duration::from_millis(5))
}

pub struct Harness {
    pub storage: InMemoryStorageEngine,
    pub transport: Arc<InMemoryTransport>,
    pub scheduler: FlowScheduler,
}

pub fn harness() -> Harness {
    harness_with(fast_policy(), ServiceHub::default())
}

pub fn harness_with(policy: HospitalPolicy, services: ServiceHub) -> Harness {
    harness_on(InMemoryStorageEngine::new(), policy, services)
}

/// Scheduler nuevo sobre un storage existente (simula un reinicio del nodo).
pub fn harness_on(storage: InMemoryStorageEngine, policy: HospitalPolicy, services: ServiceHub) -> Harness {
    let transport = Arc::new(InMemoryTransport::new());
    let scheduler = FlowScheduler::new(Arc::new(storage.clone()),
                                       transport.clone(),
                                       services,
                                       SchedulerConfig::default().with_max_workers(4).with_hospital(policy));
    Harness { storage,
              transport,
              scheduler }
}

/// Espera (con sondeo) hasta que el estado del flow cumpla `pred`.
pub async fn wait_for_status<F>(scheduler: &FlowScheduler, flow_id: FlowId, pred: F) -> FlowStatus
    where F: Fn(&FlowStatus) -> bool
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(status) = scheduler.status(flow_id) {
            if pred(&status) {
                return status;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("flow {flow_id} did not reach expected status, last: {:?}", scheduler.status(flow_id));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn committed_notes(storage: &InMemoryStorageEngine) -> Vec<Note> {
    use ledger_core::StorageEngine;
    storage.read_committed(Note::TABLE)
           .unwrap()
           .iter()
           .map(|r| Note::from_row(r).unwrap())
           .collect()
}
