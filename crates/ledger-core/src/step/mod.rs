pub mod definition;
pub mod run_result;

pub use definition::{FlowStep, FnStep};
pub use run_result::{StepRunResult, Suspension};
