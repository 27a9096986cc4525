use std::sync::Arc;
use std::time::Duration;

use ledger_core::{FlowOutcome, FlowStatus, HospitalPolicy, InMemoryStorageEngine, SchedulerConfig};
use ledgerflow::demo::{transfer_cash, Demo, TransferRequest, COUNTERPARTY};
use serde_json::json;

fn demo() -> Demo {
    let policy = HospitalPolicy::default().with_backoff(Duration::from_millis(1), Duration::from_millis(5));
    Demo::new(Arc::new(InMemoryStorageEngine::new()),
              SchedulerConfig::default().with_max_workers(4).with_hospital(policy)).with_settle_timeout(Duration::from_secs(5))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scope_scenarios_settle_as_documented() {
    let demo = demo();
    let reports = demo.run_scope_scenarios().await.unwrap();
    let by_name = |name: &str| reports.iter().find(|r| r.name == name).unwrap();

    let sleep = by_name("unflushed-sleep");
    assert_eq!(sleep.outcome, Some(FlowOutcome::Completed(json!({ "visible_before_sleep": 0 }))));
    assert_eq!(sleep.committed.len(), 3);

    let caught = by_name("flush-violation-caught");
    assert_eq!(caught.outcome, Some(FlowOutcome::Completed(json!({ "violation_caught": true }))));
    assert_eq!(caught.committed.len(), 1);

    let uncaught = by_name("flush-violation-uncaught");
    assert_eq!(uncaught.status, Some(FlowStatus::Observation));
    assert_eq!(uncaught.outcome, None);
    assert_eq!(uncaught.committed.len(), 1);

    let implicit = by_name("implicit-duplicate");
    assert_eq!(implicit.status, Some(FlowStatus::Observation));
    assert!(implicit.committed.is_empty());

    let fresh = by_name("fresh-scope-after-violation");
    assert_eq!(fresh.outcome, Some(FlowOutcome::Completed(json!({ "violation_caught": true }))));
    assert_eq!(fresh.committed.len(), 3);

    let poisoned = by_name("poisoned-scope-reuse");
    assert_eq!(poisoned.status, Some(FlowStatus::Observation));
    assert_eq!(poisoned.committed.len(), 1);

    assert_eq!(demo.scheduler.list_observation().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ledger_flows_complete_against_counterparty() {
    let demo = demo();
    let reports = demo.run_ledger_flows().await.unwrap();
    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert!(matches!(report.outcome, Some(FlowOutcome::Completed(_))), "{report:?}");
        assert_eq!(report.committed.len(), 1);
    }
    let transfer = &reports[1];
    match &transfer.outcome {
        Some(FlowOutcome::Completed(v)) => assert_eq!(v["owner"], json!(COUNTERPARTY)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn negative_transfer_is_rejected_before_sending() {
    let demo = demo();
    let input = serde_json::to_value(TransferRequest { run: "neg".into(),
                                                       from: "alice".into(),
                                                       to: COUNTERPARTY.into(),
                                                       amount: -5 }).unwrap();
    let report = demo.run(transfer_cash().unwrap(), input, "neg").await.unwrap();
    assert_eq!(report.outcome,
               Some(FlowOutcome::Failed("contract rejected: positive-amount: amounts must be positive".into())));
    assert!(report.committed.is_empty());
    assert!(demo.transport.sent().is_empty());
}
