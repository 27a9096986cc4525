use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{CoreEngineError, ErrorClass};
use crate::model::FlowId;

/// Resultado registrado para un flow en el hospital.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HospitalOutcome {
    /// Dado de alta para reintento desde el último checkpoint.
    Discharged,
    /// En observación: sin reintentos automáticos hasta intervención.
    Observation,
    /// Fallo terminal; el checkpoint del flow se elimina.
    Permanent,
}

impl HospitalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HospitalOutcome::Discharged => "discharged",
            HospitalOutcome::Observation => "observation",
            HospitalOutcome::Permanent => "permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discharged" => Some(HospitalOutcome::Discharged),
            "observation" => Some(HospitalOutcome::Observation),
            "permanent" => Some(HospitalOutcome::Permanent),
            _ => None,
        }
    }
}

/// Historia clínica de un flow: se crea con el primer error no manejado, se
/// actualiza en cada error siguiente y se borra al completar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HospitalRecord {
    pub flow_id: FlowId,
    pub error_class: ErrorClass,
    pub attempt_count: u32,
    pub outcome: HospitalOutcome,
    pub last_error: CoreEngineError,
    pub updated_at: DateTime<Utc>,
}

/// Evento publicado a los suscriptores del hospital.
#[derive(Debug, Clone, PartialEq)]
pub struct HospitalEvent {
    pub flow_id: FlowId,
    pub outcome: HospitalOutcome,
    pub attempt: u32,
    pub error: CoreEngineError,
}
