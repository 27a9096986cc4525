use std::sync::Arc;

use ledger_core::{FlowOutcome, InMemoryStorageEngine, StorageEngine};
use ledger_persistence::{build_dev_pool_from_env, PgStorageEngine};
use ledgerflow::config::AppConfig;
use ledgerflow::demo::{Demo, ScenarioReport};
use ledgerflow::errors::AppError;
use log::info;

fn print_report(report: &ScenarioReport) {
    let outcome = match &report.outcome {
        Some(FlowOutcome::Completed(v)) => format!("completed {v}"),
        Some(FlowOutcome::Failed(reason)) => format!("failed: {reason}"),
        None => "sin resultado".to_string(),
    };
    println!("[{}] flow={} status={:?}", report.name, report.flow_id, report.status);
    println!("    resultado: {}", outcome);
    println!("    confirmadas: {:?}", report.committed);
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    env_logger::init();
    let config = AppConfig::from_env()?;
    info!("ledgerflow:start config={:?}", config);

    let storage: Arc<dyn StorageEngine> = match &config.database_url {
        Some(_) => {
            println!("Storage: Postgres");
            Arc::new(PgStorageEngine::from_pool(build_dev_pool_from_env()?))
        }
        None => {
            println!("Storage: en memoria (DATABASE_URL no definido)");
            Arc::new(InMemoryStorageEngine::new())
        }
    };

    let demo = Demo::new(storage, config.scheduler_config());

    println!("\n== Escenarios de scopes ==");
    for report in demo.run_scope_scenarios().await? {
        print_report(&report);
    }

    println!("\n== Flows de ledger ==");
    for report in demo.run_ledger_flows().await? {
        print_report(&report);
    }

    let observed = demo.scheduler.list_observation();
    println!("\n== Observación ({}) ==", observed.len());
    for record in observed {
        println!("  {} class={} attempts={} error={}",
                 record.flow_id,
                 record.error_class.as_str(),
                 record.attempt_count,
                 record.last_error);
    }
    Ok(())
}
