//! Flows de ejemplo que ejecuta el binario: los cinco escenarios de scopes
//! de persistencia y dos flows de ledger (emisión y transferencia con una
//! contraparte simulada que contrafirma).
//!
//! Cada ejecución usa un prefijo `run` propio en las claves para que las
//! corridas sobre Postgres no colisionen entre sí.

use std::sync::Arc;
use std::time::Duration;

use ledger_core::session::Envelope;
use ledger_core::{Blake3Signer, CoreEngineError, Entity, FlowContext, FlowDefinition, FlowId, FlowOutcome, FlowScheduler,
                  FlowStatus, InMemoryTransport, ProposedTransaction, RuleVerifier, SchedulerConfig, ServiceHub, SessionId,
                  Signature, SigningService, StepRunResult, StorageEngine, Suspension};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const NOTARY: &str = "notary-demo";
pub const COUNTERPARTY: &str = "bank-b";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub memo: String,
}

impl Entity for LedgerEntry {
    const TABLE: &'static str = "ledger_entries";

    fn primary_key(&self) -> String {
        self.id.clone()
    }
}

/// Estado de efectivo emitido o transferido.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashState {
    pub id: String,
    pub owner: String,
    pub amount: i64,
    pub signature: Signature,
}

impl Entity for CashState {
    const TABLE: &'static str = "cash_states";

    fn primary_key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunInput {
    run: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRequest {
    pub run: String,
    pub owner: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub run: String,
    pub from: String,
    pub to: String,
    pub amount: i64,
}

/// Propuesta enviada a la contraparte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub tx: ProposedTransaction,
    pub signature: Signature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acceptance {
    pub accepted: bool,
    pub reason: Option<String>,
    pub countersignature: Option<Signature>,
}

fn run_of(ctx: &FlowContext) -> Result<String, CoreEngineError> {
    Ok(ctx.input::<RunInput>()?.run)
}

fn entry(run: &str, n: u32, memo: &str) -> LedgerEntry {
    LedgerEntry { id: format!("{run}-{n}"),
                  memo: memo.to_string() }
}

fn session_of(ctx: &FlowContext) -> Result<SessionId, CoreEngineError> {
    ctx.local("session")?
       .ok_or_else(|| CoreEngineError::Internal("session not recorded".into()))
}

// --- Escenarios de scopes ---

/// Tres escrituras en una scope sin flush explícito y luego un sleep.
pub fn unflushed_sleep() -> Result<FlowDefinition, CoreEngineError> {
    FlowDefinition::builder("unflushed-sleep").step("write", |ctx| {
                                                  let run = run_of(ctx)?;
                                                  ctx.with_scope(|ctx| {
                                                         for n in 1..=3 {
                                                             ctx.persist(&entry(&run, n, "three-then-sleep"))?;
                                                         }
                                                         Ok(())
                                                     })?;
                                                  let prefix = format!("{run}-");
                                                  let visible = ctx.committed::<LedgerEntry>()?
                                                                   .iter()
                                                                   .filter(|e| e.id.starts_with(&prefix))
                                                                   .count();
                                                  ctx.set_local("visible_before_sleep", &visible)?;
                                                  Ok(StepRunResult::Suspend(Suspension::Sleep(Duration::from_millis(50))))
                                              })
                                              .step("report", |ctx| {
                                                  let visible: Option<usize> = ctx.local("visible_before_sleep")?;
                                                  Ok(StepRunResult::Complete(json!({ "visible_before_sleep": visible })))
                                              })
                                              .build()
}

/// Scope A confirma la clave 1; la scope B repite la clave y hace flush.
pub fn duplicate_after_commit(catch: bool) -> Result<FlowDefinition, CoreEngineError> {
    let name = if catch { "flush-violation-caught" } else { "flush-violation-uncaught" };
    FlowDefinition::builder(name).step("scope-a", |ctx| {
                                     let run = run_of(ctx)?;
                                     ctx.with_scope(|ctx| ctx.persist(&entry(&run, 1, "scope-a")))?;
                                     Ok(StepRunResult::Suspend(Suspension::Checkpoint))
                                 })
                                 .step("scope-b", move |ctx| {
                                     let run = run_of(ctx)?;
                                     let caught = ctx.with_scope(|ctx| {
                                                         ctx.persist(&entry(&run, 1, "scope-b"))?;
                                                         match ctx.flush() {
                                                             Err(CoreEngineError::ConstraintViolation { .. }) if catch => Ok(true),
                                                             other => other.map(|_| false),
                                                         }
                                                     })?;
                                     Ok(StepRunResult::Complete(json!({ "violation_caught": caught })))
                                 })
                                 .build()
}

/// Clave duplicada dentro de una única scope, sin flush intermedio.
pub fn duplicate_in_one_scope() -> Result<FlowDefinition, CoreEngineError> {
    FlowDefinition::builder("implicit-duplicate").step("write", |ctx| {
                                                     let run = run_of(ctx)?;
                                                     ctx.with_scope(|ctx| {
                                                            ctx.persist(&entry(&run, 1, "first"))?;
                                                            ctx.persist(&entry(&run, 1, "second"))
                                                        })?;
                                                     Ok(StepRunResult::Suspend(Suspension::Sleep(Duration::from_millis(10))))
                                                 })
                                                 .build()
}

/// Violación capturada y luego una scope nueva con dos escrituras.
pub fn fresh_scope_after_violation() -> Result<FlowDefinition, CoreEngineError> {
    FlowDefinition::builder("fresh-scope-after-violation").step("write", |ctx| {
                                                              let run = run_of(ctx)?;
                                                              ctx.with_scope(|ctx| ctx.persist(&entry(&run, 1, "seed")))?;
                                                              let caught = ctx.with_scope(|ctx| {
                                                                                  ctx.persist(&entry(&run, 1, "duplicate"))?;
                                                                                  Ok(ctx.flush().is_err())
                                                                              })?;
                                                              ctx.with_scope(|ctx| {
                                                                     ctx.persist(&entry(&run, 2, "fresh"))?;
                                                                     ctx.persist(&entry(&run, 3, "fresh"))
                                                                 })?;
                                                              Ok(StepRunResult::Complete(json!({ "violation_caught": caught })))
                                                          })
                                                          .build()
}

/// Violación capturada y dos escrituras más en la misma scope envenenada.
pub fn poisoned_scope_reuse() -> Result<FlowDefinition, CoreEngineError> {
    FlowDefinition::builder("poisoned-scope-reuse").step("seed", |ctx| {
                                                       let run = run_of(ctx)?;
                                                       ctx.with_scope(|ctx| ctx.persist(&entry(&run, 1, "seed")))?;
                                                       Ok(StepRunResult::Suspend(Suspension::Checkpoint))
                                                   })
                                                   .step("reuse", |ctx| {
                                                       let run = run_of(ctx)?;
                                                       ctx.with_scope(|ctx| {
                                                              ctx.persist(&entry(&run, 1, "duplicate"))?;
                                                              let _ = ctx.flush();
                                                              let _ = ctx.persist(&entry(&run, 2, "late"));
                                                              let _ = ctx.persist(&entry(&run, 3, "late"));
                                                              Ok(())
                                                          })?;
                                                       Ok(StepRunResult::Suspend(Suspension::Checkpoint))
                                                   })
                                                   .build()
}

// --- Flows de ledger ---

pub fn issue_cash() -> Result<FlowDefinition, CoreEngineError> {
    FlowDefinition::builder("issue-cash").step("propose", |ctx| {
                                             let req: IssueRequest = ctx.input()?;
                                             let tx = ProposedTransaction::new("issue").with_output(json!({ "owner": &req.owner, "amount": req.amount }))
                                                                                       .with_signer(NOTARY);
                                             ctx.verify(&tx)?;
                                             let signature = ctx.sign(&tx)?;
                                             let state = CashState { id: format!("{}-{}", req.run, tx.id()?),
                                                                     owner: req.owner,
                                                                     amount: req.amount,
                                                                     signature };
                                             ctx.with_scope(|ctx| ctx.persist(&state))?;
                                             ctx.set_local("cash_id", &state.id)?;
                                             Ok(StepRunResult::Suspend(Suspension::Checkpoint))
                                         })
                                         .step("done", |ctx| {
                                             let id: Option<String> = ctx.local("cash_id")?;
                                             Ok(StepRunResult::Complete(json!({ "cash_id": id })))
                                         })
                                         .build()
}

pub fn transfer_cash() -> Result<FlowDefinition, CoreEngineError> {
    FlowDefinition::builder("transfer-cash").step("propose", |ctx| {
                                                let req: TransferRequest = ctx.input()?;
                                                let tx = ProposedTransaction::new("transfer").with_input(json!({ "owner": &req.from, "amount": req.amount }))
                                                                                             .with_output(json!({ "owner": &req.to, "amount": req.amount }))
                                                                                             .with_signer(NOTARY)
                                                                                             .with_signer(&req.to);
                                                ctx.verify(&tx)?;
                                                let signature = ctx.sign(&tx)?;
                                                let session = ctx.initiate_session(&req.to)?;
                                                ctx.set_local("session", &session)?;
                                                ctx.set_local("tx", &tx)?;
                                                let payload = serde_json::to_value(Proposal { tx, signature })?;
                                                Ok(StepRunResult::Suspend(Suspension::Send { session, payload }))
                                            })
                                            .step("await", |ctx| {
                                                let session = session_of(ctx)?;
                                                Ok(StepRunResult::Suspend(Suspension::Receive { session,
                                                                                                timeout: Some(Duration::from_secs(5)) }))
                                            })
                                            .step("finalize", |ctx| {
                                                let req: TransferRequest = ctx.input()?;
                                                let session = session_of(ctx)?;
                                                let reply: Acceptance = ctx.received_as(session)?;
                                                if !reply.accepted {
                                                    let reason = reply.reason.unwrap_or_else(|| "counterparty declined".into());
                                                    return Err(CoreEngineError::ContractRejected(reason));
                                                }
                                                let signature = reply.countersignature
                                                                     .ok_or_else(|| CoreEngineError::ContractRejected("missing countersignature".into()))?;
                                                let tx: ProposedTransaction = ctx.local("tx")?
                                                                                 .ok_or_else(|| CoreEngineError::Internal("proposal not recorded".into()))?;
                                                let state = CashState { id: format!("{}-{}", req.run, tx.id()?),
                                                                        owner: req.to,
                                                                        amount: req.amount,
                                                                        signature };
                                                ctx.with_scope(|ctx| ctx.persist(&state))?;
                                                Ok(StepRunResult::Complete(json!({ "cash_id": state.id, "owner": state.owner })))
                                            })
                                            .build()
}

fn positive_outputs(tx: &ProposedTransaction) -> bool {
    tx.outputs
      .iter()
      .all(|o| o["amount"].as_i64().map(|a| a > 0).unwrap_or(false))
}

/// Servicios del notario de la demo: firma blake3 y dos reglas de contrato.
pub fn ledger_services() -> ServiceHub {
    let verifier = RuleVerifier::new().rule("positive-amount", |tx| {
                                          if positive_outputs(tx) {
                                              Ok(())
                                          } else {
                                              Err("amounts must be positive".into())
                                          }
                                      })
                                      .rule("has-signers", |tx| {
                                          if tx.signers.is_empty() {
                                              Err("no signers".into())
                                          } else {
                                              Ok(())
                                          }
                                      });
    ServiceHub::new(Arc::new(Blake3Signer::from_identity(NOTARY)), Arc::new(verifier))
}

fn respond(signer: &Blake3Signer, proposal: &Proposal) -> Acceptance {
    if !positive_outputs(&proposal.tx) {
        return Acceptance { accepted: false,
                            reason: Some("non-positive amount".into()),
                            countersignature: None };
    }
    match proposal.tx.signing_bytes() {
        Ok(bytes) => Acceptance { accepted: true,
                                  reason: None,
                                  countersignature: Some(signer.sign(&bytes)) },
        Err(e) => Acceptance { accepted: false,
                               reason: Some(e.to_string()),
                               countersignature: None },
    }
}

/// Contraparte simulada: escucha lo que envía el transporte en memoria,
/// contrafirma las propuestas válidas y responde por la misma sesión.
pub fn spawn_counterparty(scheduler: FlowScheduler, transport: &InMemoryTransport, identity: &str) -> JoinHandle<()> {
    let mut sent = transport.subscribe();
    let signer = Blake3Signer::from_identity(identity);
    tokio::spawn(async move {
        loop {
            let msg = match sent.recv().await {
                Ok(m) => m,
                Err(RecvError::Lagged(n)) => {
                    warn!("counterparty:lagged skipped={}", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let envelope = match Envelope::from_bytes(&msg.bytes) {
                Ok(e) => e,
                Err(e) => {
                    warn!("counterparty:undecodable err={}", e);
                    continue;
                }
            };
            let reply = match serde_json::from_value::<Proposal>(envelope.payload) {
                Ok(p) => respond(&signer, &p),
                Err(e) => Acceptance { accepted: false,
                                       reason: Some(format!("malformed proposal: {e}")),
                                       countersignature: None },
            };
            let payload = match serde_json::to_value(&reply) {
                Ok(v) => v,
                Err(e) => {
                    warn!("counterparty:encode err={}", e);
                    continue;
                }
            };
            if let Err(e) = scheduler.deliver(envelope.session, payload).await {
                warn!("counterparty:deliver session={} err={}", envelope.session, e);
            }
        }
    })
}

/// Resumen de una ejecución de la demo.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: String,
    pub flow_id: FlowId,
    pub status: Option<FlowStatus>,
    pub outcome: Option<FlowOutcome>,
    /// Claves confirmadas por esta ejecución.
    pub committed: Vec<String>,
}

pub struct Demo {
    pub scheduler: FlowScheduler,
    pub storage: Arc<dyn StorageEngine>,
    pub transport: Arc<InMemoryTransport>,
    settle_timeout: Duration,
}

fn new_run(name: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{name}-{}", &id[..8])
}

impl Demo {
    pub fn new(storage: Arc<dyn StorageEngine>, config: SchedulerConfig) -> Self {
        let transport = Arc::new(InMemoryTransport::new());
        let scheduler = FlowScheduler::new(storage.clone(), transport.clone(), ledger_services(), config);
        Self { scheduler,
               storage,
               transport,
               settle_timeout: Duration::from_secs(10) }
    }

    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    /// Arranca un flow y espera a que termine o quede en observación.
    pub async fn run(&self, definition: FlowDefinition, input: Value, run: &str) -> Result<ScenarioReport, CoreEngineError> {
        let name = definition.name.clone();
        let flow_id = self.scheduler.start(Arc::new(definition), input).await?;
        let outcome = self.settle(flow_id).await?;
        let report = ScenarioReport { name,
                                      flow_id,
                                      status: self.scheduler.status(flow_id),
                                      outcome,
                                      committed: self.committed_for(run)? };
        info!("demo:settled name={} flow_id={} status={:?}", report.name, flow_id, report.status);
        Ok(report)
    }

    async fn settle(&self, flow_id: FlowId) -> Result<Option<FlowOutcome>, CoreEngineError> {
        let deadline = tokio::time::Instant::now() + self.settle_timeout;
        loop {
            if let Some(outcome) = self.scheduler.await_outcome(flow_id, Duration::from_millis(20)).await? {
                return Ok(Some(outcome));
            }
            if self.scheduler.status(flow_id) == Some(FlowStatus::Observation) || tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn committed_for(&self, run: &str) -> Result<Vec<String>, CoreEngineError> {
        let prefix = format!("{run}-");
        let mut keys = Vec::new();
        for table in [LedgerEntry::TABLE, CashState::TABLE] {
            keys.extend(self.storage
                            .read_committed(table)?
                            .into_iter()
                            .map(|r| r.key)
                            .filter(|k| k.starts_with(&prefix)));
        }
        Ok(keys)
    }

    async fn run_scenario(&self, definition: FlowDefinition) -> Result<ScenarioReport, CoreEngineError> {
        let run = new_run(&definition.name);
        self.run(definition, json!({ "run": run }), &run).await
    }

    /// Los cinco escenarios de scopes (el segundo en sus dos variantes).
    pub async fn run_scope_scenarios(&self) -> Result<Vec<ScenarioReport>, CoreEngineError> {
        let scenarios = vec![unflushed_sleep()?,
                             duplicate_after_commit(true)?,
                             duplicate_after_commit(false)?,
                             duplicate_in_one_scope()?,
                             fresh_scope_after_violation()?,
                             poisoned_scope_reuse()?];
        let mut reports = Vec::with_capacity(scenarios.len());
        for def in scenarios {
            reports.push(self.run_scenario(def).await?);
        }
        Ok(reports)
    }

    /// Emisión y transferencia contra la contraparte simulada.
    pub async fn run_ledger_flows(&self) -> Result<Vec<ScenarioReport>, CoreEngineError> {
        let counterparty = spawn_counterparty(self.scheduler.clone(), &self.transport, COUNTERPARTY);
        let mut reports = Vec::new();

        let run = new_run("issue");
        let issue = IssueRequest { run: run.clone(),
                                   owner: "alice".into(),
                                   amount: 100 };
        reports.push(self.run(issue_cash()?, serde_json::to_value(issue)?, &run).await?);

        let run = new_run("transfer");
        let transfer = TransferRequest { run: run.clone(),
                                         from: "alice".into(),
                                         to: COUNTERPARTY.into(),
                                         amount: 40 };
        let report = self.run(transfer_cash()?, serde_json::to_value(transfer)?, &run).await;
        counterparty.abort();
        reports.push(report?);
        Ok(reports)
    }

    pub async fn run_all(&self) -> Result<Vec<ScenarioReport>, CoreEngineError> {
        let mut reports = self.run_scope_scenarios().await?;
        reports.extend(self.run_ledger_flows().await?);
        Ok(reports)
    }
}
