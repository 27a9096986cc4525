//! Política de triage configurable por despliegue.
//!
//! `decide` es una función pura: misma clase de error y mismo número de
//! intento producen siempre el mismo diagnóstico.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorClass;

/// Tratamiento asignado a una clase de error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Treatment {
    /// Reintentar (acotado por `max_discharges`, luego observación).
    Retry,
    /// Observación inmediata, sin reintento.
    Observe,
    /// Fallo permanente.
    Fail,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HospitalPolicy {
    /// Altas (reintentos) permitidas antes de escalar a observación.
    pub max_discharges: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub treatments: BTreeMap<ErrorClass, Treatment>,
}

impl Default for HospitalPolicy {
    fn default() -> Self {
        let treatments = BTreeMap::from([(ErrorClass::Transient, Treatment::Retry),
                                         (ErrorClass::FlushConstraint, Treatment::Retry),
                                         (ErrorClass::CommitConflict, Treatment::Retry),
                                         (ErrorClass::InconsistentScope, Treatment::Observe),
                                         (ErrorClass::ScopeReuse, Treatment::Observe),
                                         (ErrorClass::Programming, Treatment::Observe),
                                         (ErrorClass::Business, Treatment::Fail),
                                         (ErrorClass::NonRetryable, Treatment::Fail)]);
        Self { max_discharges: 3,
               backoff_base: Duration::from_millis(100),
               backoff_cap: Duration::from_secs(5),
               treatments }
    }
}

impl HospitalPolicy {
    pub fn with_max_discharges(mut self, n: u32) -> Self {
        self.max_discharges = n;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_treatment(mut self, class: ErrorClass, treatment: Treatment) -> Self {
        self.treatments.insert(class, treatment);
        self
    }

    /// Clases sin entrada explícita se observan.
    pub fn treatment(&self, class: ErrorClass) -> Treatment {
        self.treatments.get(&class).copied().unwrap_or(Treatment::Observe)
    }

    /// Backoff exponencial `base * 2^(attempt-1)`, acotado por `backoff_cap`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

/// Diagnóstico de una ocurrencia de error (salida del estado ANALYZING).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    DischargeAndRetry { delay: Duration },
    KeepForObservation,
    PermanentFailure,
}

/// `attempt` es el número de esta ocurrencia para el flow (1 = primera).
pub fn decide(policy: &HospitalPolicy, class: ErrorClass, attempt: u32) -> Diagnosis {
    match policy.treatment(class) {
        Treatment::Retry if attempt <= policy.max_discharges => {
            Diagnosis::DischargeAndRetry { delay: policy.retry_delay(attempt) }
        }
        Treatment::Retry | Treatment::Observe => Diagnosis::KeepForObservation,
        Treatment::Fail => Diagnosis::PermanentFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_escalate_after_budget() {
        let p = HospitalPolicy::default();
        for attempt in 1..=3 {
            assert!(matches!(decide(&p, ErrorClass::Transient, attempt), Diagnosis::DischargeAndRetry { .. }));
        }
        assert_eq!(decide(&p, ErrorClass::Transient, 4), Diagnosis::KeepForObservation);
    }

    #[test]
    fn scope_errors_go_straight_to_observation() {
        let p = HospitalPolicy::default();
        assert_eq!(decide(&p, ErrorClass::InconsistentScope, 1), Diagnosis::KeepForObservation);
        assert_eq!(decide(&p, ErrorClass::ScopeReuse, 1), Diagnosis::KeepForObservation);
    }

    #[test]
    fn non_retryable_is_permanent() {
        let p = HospitalPolicy::default();
        assert_eq!(decide(&p, ErrorClass::NonRetryable, 1), Diagnosis::PermanentFailure);
        assert_eq!(decide(&p, ErrorClass::Business, 1), Diagnosis::PermanentFailure);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let p = HospitalPolicy::default().with_backoff(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(p.retry_delay(1), Duration::from_millis(10));
        assert_eq!(p.retry_delay(2), Duration::from_millis(20));
        assert_eq!(p.retry_delay(3), Duration::from_millis(40));
        assert_eq!(p.retry_delay(4), Duration::from_millis(50));
        assert_eq!(p.retry_delay(40), Duration::from_millis(50));
    }

    #[test]
    fn treatments_are_overridable() {
        let p = HospitalPolicy::default().with_treatment(ErrorClass::FlushConstraint, Treatment::Observe);
        assert_eq!(decide(&p, ErrorClass::FlushConstraint, 1), Diagnosis::KeepForObservation);
    }
}
