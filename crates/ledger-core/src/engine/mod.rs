//! Motor de ejecución de un flow: contexto prestado a los steps y máquina de
//! estados con el protocolo de suspensión.

pub mod flow_ctx;
pub mod machine;

pub use flow_ctx::{FlowContext, FlowEnv};
pub use machine::{Advance, FlowStateMachine, ResumeEvent};
