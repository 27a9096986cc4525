use crate::engine::FlowContext;
use crate::errors::CoreEngineError;

use super::run_result::StepRunResult;

/// Un step de la lógica de un flow. Entre dos puntos de suspensión los steps
/// se ejecutan sin preempción sobre un `FlowContext` exclusivo del flow.
///
/// La lógica debe ser re-ejecutable: tras un fallo el flow se reanuda desde
/// su último checkpoint y repite los steps del intervalo.
pub trait FlowStep: Send + Sync {
    /// Identificador estable y único dentro del flow.
    fn id(&self) -> &str;

    fn run(&self, ctx: &mut FlowContext) -> Result<StepRunResult, CoreEngineError>;
}

type StepFn = dyn Fn(&mut FlowContext) -> Result<StepRunResult, CoreEngineError> + Send + Sync;

/// Step definido por un closure.
pub struct FnStep {
    id: String,
    f: Box<StepFn>,
}

impl FnStep {
    pub fn new<F>(id: impl Into<String>, f: F) -> Self
        where F: Fn(&mut FlowContext) -> Result<StepRunResult, CoreEngineError> + Send + Sync + 'static
    {
        Self { id: id.into(),
               f: Box::new(f) }
    }
}

impl FlowStep for FnStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&self, ctx: &mut FlowContext) -> Result<StepRunResult, CoreEngineError> {
        (self.f)(ctx)
    }
}

impl std::fmt::Debug for FnStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStep").field("id", &self.id).finish()
    }
}
