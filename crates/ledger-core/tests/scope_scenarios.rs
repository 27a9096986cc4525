mod test_support;

use std::sync::Arc;
use std::time::Duration;

use ledger_core::{CoreEngineError, ErrorClass, FlowDefinition, FlowOutcome, FlowStatus, HospitalOutcome, StepRunResult,
                  Suspension};
use serde_json::json;
use test_support::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unflushed_writes_become_durable_at_sleep() {
    let h = harness();
    let def = FlowDefinition::builder("three-then-sleep").step("write", |ctx| {
                                                             ctx.with_scope(|ctx| {
                                                                    for id in 1..=3 {
                                                                        ctx.persist(&note(id, "s1"))?;
                                                                    }
                                                                    Ok(())
                                                                })?;
                                                             let seen = ctx.committed::<Note>()?.len();
                                                             ctx.set_local("seen_before", &seen)?;
                                                             Ok(StepRunResult::Suspend(Suspension::Sleep(Duration::from_millis(50))))
                                                         })
                                                         .step("done", |ctx| {
                                                             let seen: Option<usize> = ctx.local("seen_before")?;
                                                             Ok(StepRunResult::Complete(json!({ "seen_before": seen })))
                                                         })
                                                         .build()
                                                         .unwrap();
    let flow_id = h.scheduler.start(Arc::new(def), json!(null)).await.unwrap();
    let outcome = h.scheduler.await_outcome(flow_id, WAIT).await.unwrap();
    assert_eq!(outcome, Some(FlowOutcome::Completed(json!({ "seen_before": 0 }))));
    assert_eq!(committed_notes(&h.storage).len(), 3);
    assert!(h.scheduler.list_observation().is_empty());
}

fn seed_then_duplicate(catch: bool) -> FlowDefinition {
    FlowDefinition::builder(if catch { "dup-caught" } else { "dup-uncaught" }).step("scope-a", |ctx| {
                                                                                ctx.with_scope(|ctx| ctx.persist(&note(1, "from-a")))?;
                                                                                Ok(StepRunResult::Suspend(Suspension::Checkpoint))
                                                                            })
                                                                            .step("scope-b", move |ctx| {
                                                                                let caught = ctx.with_scope(|ctx| {
                                                                                                    ctx.persist(&note(1, "from-b"))?;
                                                                                                    match ctx.flush() {
                                                                                                        Err(CoreEngineError::ConstraintViolation { .. }) if catch => Ok(true),
                                                                                                        other => other.map(|_| false),
                                                                                                    }
                                                                                                })?;
                                                                                Ok(StepRunResult::Complete(json!({ "caught": caught })))
                                                                            })
                                                                            .build()
                                                                            .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn caught_flush_violation_keeps_earlier_scope() {
    let h = harness();
    let mut events = h.scheduler.hospital().subscribe();
    let flow_id = h.scheduler.start(Arc::new(seed_then_duplicate(true)), json!(null)).await.unwrap();
    let outcome = h.scheduler.await_outcome(flow_id, WAIT).await.unwrap();
    assert_eq!(outcome, Some(FlowOutcome::Completed(json!({ "caught": true }))));
    assert_eq!(committed_notes(&h.storage), vec![note(1, "from-a")]);
    assert!(events.try_recv().is_err(), "caught violations never reach the hospital");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uncaught_flush_violation_is_retried_then_observed() {
    let h = harness();
    let mut events = h.scheduler.hospital().subscribe();
    let flow_id = h.scheduler.start(Arc::new(seed_then_duplicate(false)), json!(null)).await.unwrap();
    wait_for_status(&h.scheduler, flow_id, |s| *s == FlowStatus::Observation).await;

    let first = events.recv().await.unwrap();
    assert_eq!(first.outcome, HospitalOutcome::Discharged);
    assert_eq!(first.attempt, 1);
    assert!(matches!(first.error, CoreEngineError::ConstraintViolation { .. }));

    let record = h.scheduler.list_observation().pop().unwrap();
    assert_eq!(record.error_class, ErrorClass::FlushConstraint);
    assert_eq!(record.attempt_count, 4);
    assert_eq!(committed_notes(&h.storage), vec![note(1, "from-a")]);
    assert_eq!(h.scheduler.await_outcome(flow_id, Duration::from_millis(20)).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_inside_one_scope_goes_to_observation_without_retry() {
    let h = harness();
    let mut events = h.scheduler.hospital().subscribe();
    let def = FlowDefinition::builder("implicit-dup").step("write", |ctx| {
                                                         ctx.with_scope(|ctx| {
                                                                ctx.persist(&note(1, "x"))?;
                                                                ctx.persist(&note(1, "y"))?;
                                                                // capturarlo dentro de la scope no lo evita
                                                                let _ = ctx.flush();
                                                                Ok(())
                                                            })?;
                                                         Ok(StepRunResult::Suspend(Suspension::Sleep(Duration::from_millis(1))))
                                                     })
                                                     .build()
                                                     .unwrap();
    let flow_id = h.scheduler.start(Arc::new(def), json!(null)).await.unwrap();
    wait_for_status(&h.scheduler, flow_id, |s| *s == FlowStatus::Observation).await;

    let ev = events.recv().await.unwrap();
    assert_eq!(ev.outcome, HospitalOutcome::Observation);
    assert_eq!(ev.attempt, 1);
    assert!(matches!(ev.error, CoreEngineError::ImplicitConstraintViolation { .. }));
    assert!(events.try_recv().is_err(), "no retry attempted");
    assert!(committed_notes(&h.storage).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fresh_scope_after_caught_violation_commits() {
    let h = harness();
    let def = FlowDefinition::builder("fresh-scope").step("write", |ctx| {
                                                        ctx.with_scope(|ctx| ctx.persist(&note(1, "seed")))?;
                                                        let caught = ctx.with_scope(|ctx| {
                                                                            ctx.persist(&note(1, "dup"))?;
                                                                            Ok(ctx.flush().is_err())
                                                                        })?;
                                                        ctx.with_scope(|ctx| {
                                                               ctx.persist(&note(2, "after"))?;
                                                               ctx.persist(&note(3, "after"))
                                                           })?;
                                                        Ok(StepRunResult::Complete(json!(caught)))
                                                    })
                                                    .build()
                                                    .unwrap();
    let flow_id = h.scheduler.start(Arc::new(def), json!(null)).await.unwrap();
    let outcome = h.scheduler.await_outcome(flow_id, WAIT).await.unwrap();
    assert_eq!(outcome, Some(FlowOutcome::Completed(json!(true))));
    assert_eq!(committed_notes(&h.storage),
               vec![note(1, "seed"), note(2, "after"), note(3, "after")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reusing_poisoned_scope_fails_distinctly() {
    let h = harness();
    let def = FlowDefinition::builder("poisoned-reuse").step("seed", |ctx| {
                                                           ctx.with_scope(|ctx| ctx.persist(&note(1, "seed")))?;
                                                           Ok(StepRunResult::Suspend(Suspension::Checkpoint))
                                                       })
                                                       .step("reuse", |ctx| {
                                                           ctx.with_scope(|ctx| {
                                                                  ctx.persist(&note(1, "dup"))?;
                                                                  let _ = ctx.flush();
                                                                  let _ = ctx.persist(&note(2, "late"));
                                                                  let _ = ctx.persist(&note(3, "late"));
                                                                  Ok(())
                                                              })?;
                                                           Ok(StepRunResult::Suspend(Suspension::Checkpoint))
                                                       })
                                                       .build()
                                                       .unwrap();
    let flow_id = h.scheduler.start(Arc::new(def), json!(null)).await.unwrap();
    wait_for_status(&h.scheduler, flow_id, |s| *s == FlowStatus::Observation).await;

    let record = h.scheduler.list_observation().pop().unwrap();
    assert_eq!(record.error_class, ErrorClass::ScopeReuse);
    assert!(matches!(record.last_error, CoreEngineError::ScopeRolledBack { .. }));
    assert_eq!(record.attempt_count, 1);
    assert_eq!(committed_notes(&h.storage), vec![note(1, "seed")]);

    let (seq, resume) = h.scheduler.inspect(flow_id).unwrap().unwrap();
    assert_eq!(seq, 1);
    assert_eq!(resume.step_id, "reuse");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reusing_poisoned_scope_without_checkpoint_commits_nothing() {
    let h = harness();
    let def = FlowDefinition::builder("poisoned-same-interval").step("seed-and-reuse", |ctx| {
                                                                   ctx.with_scope(|ctx| ctx.persist(&note(1, "seed")))?;
                                                                   ctx.with_scope(|ctx| {
                                                                          ctx.persist(&note(1, "dup"))?;
                                                                          let _ = ctx.flush();
                                                                          let _ = ctx.persist(&note(2, "late"));
                                                                          let _ = ctx.persist(&note(3, "late"));
                                                                          Ok(())
                                                                      })?;
                                                                   Ok(StepRunResult::Suspend(Suspension::Checkpoint))
                                                               })
                                                               .build()
                                                               .unwrap();
    let flow_id = h.scheduler.start(Arc::new(def), json!(null)).await.unwrap();
    wait_for_status(&h.scheduler, flow_id, |s| *s == FlowStatus::Observation).await;

    let record = h.scheduler.list_observation().pop().unwrap();
    assert_eq!(record.error_class, ErrorClass::ScopeReuse);
    assert!(matches!(record.last_error, CoreEngineError::ScopeRolledBack { .. }));
    assert_eq!(record.attempt_count, 1);
    assert!(committed_notes(&h.storage).is_empty());

    let (seq, resume) = h.scheduler.inspect(flow_id).unwrap().unwrap();
    assert_eq!(seq, 0);
    assert_eq!(resume.step_id, "seed-and-reuse");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_scope_is_rejected() {
    let h = harness();
    let def = FlowDefinition::builder("nested").step("nest", |ctx| {
                                                   let nested = ctx.with_scope(|ctx| ctx.with_scope(|_| Ok(())));
                                                   Ok(StepRunResult::Complete(json!(nested == Err(CoreEngineError::ScopeAlreadyOpen))))
                                               })
                                               .build()
                                               .unwrap();
    let flow_id = h.scheduler.start(Arc::new(def), json!(null)).await.unwrap();
    let outcome = h.scheduler.await_outcome(flow_id, WAIT).await.unwrap();
    assert_eq!(outcome, Some(FlowOutcome::Completed(json!(true))));
}
