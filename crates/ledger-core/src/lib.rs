//! ledger-core: núcleo de ejecución de flows reanudables.
//!
//! Máquina de estados por steps con puntos de suspensión, scopes de
//! persistencia confirmadas atómicamente con cada checkpoint, scheduler
//! tokio con pool acotado y hospital de flows para el triage de errores.
pub mod checkpoint;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod hashing;
pub mod hospital;
pub mod model;
pub mod repo;
pub mod scheduler;
pub mod scope;
pub mod services;
pub mod session;
pub mod step;
pub mod storage;

pub use checkpoint::CheckpointStore;
pub use engine::{Advance, FlowContext, FlowEnv, FlowStateMachine, ResumeEvent};
pub use errors::{classify_error, CoreEngineError, ErrorClass};
pub use hospital::{decide, Diagnosis, FlowHospital, HospitalEvent, HospitalOutcome, HospitalPolicy, HospitalRecord, Treatment};
pub use model::{Checkpoint, Entity, EntityRow, FlowId, ResumePoint, ScopeId, SessionId, WaitCondition};
pub use repo::{FlowDefinition, FlowRegistry};
pub use scheduler::{FlowOutcome, FlowScheduler, FlowStatus, SchedulerConfig};
pub use scope::ScopeState;
pub use services::{Blake3Signer, ContractVerifier, ProposedTransaction, Rejection, RuleVerifier, ServiceHub, Signature, SigningService};
pub use session::{InMemoryTransport, SentMessage, Transport};
pub use step::{FlowStep, FnStep, StepRunResult, Suspension};
pub use storage::{InMemoryStorageEngine, StorageEngine, StorageError, StorageTxn};
