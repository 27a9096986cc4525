mod test_support;

use std::sync::Arc;
use std::time::Duration;

use ledger_core::{decide, Advance, CoreEngineError, Diagnosis, ErrorClass, FlowDefinition, FlowEnv, FlowHospital, FlowId,
                  FlowOutcome, FlowStateMachine, FlowStatus, HospitalPolicy, InMemoryStorageEngine, InMemoryTransport,
                  ResumeEvent, ServiceHub, StepRunResult, StorageEngine, Suspension};
use serde_json::json;
use test_support::*;

fn env(storage: &InMemoryStorageEngine) -> FlowEnv {
    FlowEnv::new(Arc::new(storage.clone()),
                 Arc::new(InMemoryTransport::new()),
                 ServiceHub::default())
}

fn two_phase() -> Arc<FlowDefinition> {
    Arc::new(FlowDefinition::builder("two-phase").step("first", |ctx| {
                                                     ctx.with_scope(|ctx| {
                                                            ctx.persist(&note(10, "first"))?;
                                                            ctx.persist(&note(20, "first"))
                                                        })?;
                                                     Ok(StepRunResult::Suspend(Suspension::Checkpoint))
                                                 })
                                                 .step("second", |ctx| {
                                                     ctx.with_scope(|ctx| ctx.persist(&note(30, "second")))?;
                                                     Ok(StepRunResult::Complete(json!("ok")))
                                                 })
                                                 .build()
                                                 .unwrap())
}

#[test]
fn crash_between_flush_and_commit_leaves_nothing_behind() {
    let storage = InMemoryStorageEngine::new();
    let def = two_phase();
    let flow_id = FlowId::new();
    let mut machine = FlowStateMachine::new(def.clone(), flow_id, json!(null), env(&storage));
    machine.begin().unwrap();

    storage.fail_next_commits(1);
    let err = machine.run_interval(ResumeEvent::Wake).unwrap_err();
    assert!(matches!(err, CoreEngineError::StorageUnavailable(_)));
    assert!(committed_notes(&storage).is_empty());
    let cp = storage.load_checkpoint(flow_id).unwrap().unwrap();
    assert_eq!(cp.seq, 0);

    // recuperación desde el checkpoint durable
    let mut resumed = FlowStateMachine::from_checkpoint(def, &cp, env(&storage)).unwrap();
    match resumed.run_interval(ResumeEvent::Wake).unwrap() {
        Advance::Suspended(next) => assert_eq!(next.seq, 1),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(committed_notes(&storage).len(), 2);
    assert_eq!(storage.load_checkpoint(flow_id).unwrap().unwrap().seq, 1);
}

#[test]
fn redundant_resume_from_same_checkpoint_converges() {
    let storage = InMemoryStorageEngine::new();
    let def = two_phase();
    let flow_id = FlowId::new();
    let mut machine = FlowStateMachine::new(def.clone(), flow_id, json!(null), env(&storage));
    machine.begin().unwrap();
    let cp = match machine.run_interval(ResumeEvent::Wake).unwrap() {
        Advance::Suspended(cp) => cp,
        other => panic!("unexpected {other:?}"),
    };

    let mut a = FlowStateMachine::from_checkpoint(def.clone(), &cp, env(&storage)).unwrap();
    let mut b = FlowStateMachine::from_checkpoint(def, &cp, env(&storage)).unwrap();
    assert_eq!(a.run_interval(ResumeEvent::Wake).unwrap(), Advance::Completed(json!("ok")));
    assert!(b.run_interval(ResumeEvent::Wake).is_err());

    let ids: Vec<u32> = committed_notes(&storage).iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![10, 20, 30]);
    assert!(storage.load_checkpoint(flow_id).unwrap().is_none());
}

#[test]
fn redundant_checkpoint_commit_is_stale() {
    let storage = InMemoryStorageEngine::new();
    let def = Arc::new(FlowDefinition::builder("ticks").step("t1", |_| Ok(StepRunResult::Suspend(Suspension::Checkpoint)))
                                                      .step("t2", |_| Ok(StepRunResult::Suspend(Suspension::Checkpoint)))
                                                      .build()
                                                      .unwrap());
    let flow_id = FlowId::new();
    let mut machine = FlowStateMachine::new(def.clone(), flow_id, json!(null), env(&storage));
    let cp0 = machine.begin().unwrap();

    let mut a = FlowStateMachine::from_checkpoint(def.clone(), &cp0, env(&storage)).unwrap();
    let mut b = FlowStateMachine::from_checkpoint(def, &cp0, env(&storage)).unwrap();
    assert!(a.run_interval(ResumeEvent::Wake).is_ok());
    let err = b.run_interval(ResumeEvent::Wake).unwrap_err();
    assert!(matches!(err, CoreEngineError::StaleCheckpoint { expected: Some(0), found: Some(1), .. }));
    assert_eq!(storage.load_checkpoint(flow_id).unwrap().unwrap().seq, 1);
}

#[test]
fn resume_requires_matching_definition() {
    let storage = InMemoryStorageEngine::new();
    let def = two_phase();
    let mut machine = FlowStateMachine::new(def, FlowId::new(), json!(null), env(&storage));
    let cp = machine.begin().unwrap();
    let other = Arc::new(FlowDefinition::builder("two-phase").step("only", |_| Ok(StepRunResult::Continue))
                                                            .build()
                                                            .unwrap());
    assert!(matches!(FlowStateMachine::from_checkpoint(other, &cp, env(&storage)),
                     Err(CoreEngineError::DefinitionMismatch { .. })));
}

#[test]
fn triage_is_deterministic() {
    let policy = HospitalPolicy::default();
    for class in [ErrorClass::Transient,
                  ErrorClass::FlushConstraint,
                  ErrorClass::InconsistentScope,
                  ErrorClass::NonRetryable]
    {
        for attempt in 1..6 {
            let first = decide(&policy, class, attempt);
            for _ in 0..10 {
                assert_eq!(decide(&policy, class, attempt), first);
            }
        }
    }

    let errors = [CoreEngineError::StorageUnavailable("x".into()),
                  CoreEngineError::StorageUnavailable("y".into()),
                  CoreEngineError::ReceiveTimeout("s".into()),
                  CoreEngineError::Transport("t".into())];
    let a = FlowHospital::new(policy.clone());
    let b = FlowHospital::new(policy);
    let (fa, fb) = (FlowId::new(), FlowId::new());
    let da: Vec<Diagnosis> = errors.iter().map(|e| a.admit(fa, e)).collect();
    let db: Vec<Diagnosis> = errors.iter().map(|e| b.admit(fb, e)).collect();
    assert_eq!(da, db);
    assert_eq!(da[3], Diagnosis::KeepForObservation);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn storage_outage_is_retried_until_it_recovers() {
    let policy = fast_policy().with_max_discharges(1_000);
    let h = harness_with(policy, ServiceHub::default());
    let def = FlowDefinition::builder("outage").step("nap", |_| Ok(StepRunResult::Suspend(Suspension::Sleep(Duration::from_millis(30)))))
                                               .step("write", |ctx| {
                                                   ctx.with_scope(|ctx| ctx.persist(&note(5, "after-outage")))?;
                                                   Ok(StepRunResult::Complete(json!("done")))
                                               })
                                               .build()
                                               .unwrap();
    let flow_id = h.scheduler.start(Arc::new(def), json!(null)).await.unwrap();
    h.storage.set_available(false);
    wait_for_status(&h.scheduler, flow_id, |s| matches!(s, FlowStatus::Retrying { .. })).await;
    assert!(h.scheduler.hospital().record(flow_id).is_some());

    h.storage.set_available(true);
    let outcome = h.scheduler.await_outcome(flow_id, WAIT).await.unwrap();
    assert_eq!(outcome, Some(FlowOutcome::Completed(json!("done"))));
    assert_eq!(committed_notes(&h.storage), vec![note(5, "after-outage")]);
    assert!(h.scheduler.hospital().record(flow_id).is_none());
}
