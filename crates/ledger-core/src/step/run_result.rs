use std::time::Duration;

use serde_json::Value;

use crate::model::SessionId;

/// Punto de suspensión solicitado por un step. El flow se reanuda en el step
/// siguiente una vez confirmado el checkpoint y cumplida la espera.
#[derive(Debug, Clone, PartialEq)]
pub enum Suspension {
    Sleep(Duration),
    /// Completa cuando el mensaje queda registrado en el checkpoint para
    /// (re)transmisión.
    Send { session: SessionId, payload: Value },
    /// Espera el siguiente mensaje de `session`; el step siguiente lo obtiene
    /// con `FlowContext::received`. Con `timeout`, al vencer se entrega
    /// `ReceiveTimeout` a la lógica del flow.
    Receive { session: SessionId, timeout: Option<Duration> },
    /// Checkpoint explícito (p. ej. tras cerrar una scope de nivel superior).
    Checkpoint,
}

/// Resultado de ejecutar un step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepRunResult {
    /// Siguiente step sin suspender.
    Continue,
    /// Salto a otro step por id, sin suspender.
    Goto(String),
    Suspend(Suspension),
    Complete(Value),
}
