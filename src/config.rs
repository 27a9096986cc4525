//! Configuración central de la aplicación.
//! Carga variables de entorno (.env) una sola vez y expone `AppConfig`, de
//! donde salen el `SchedulerConfig` y la política del hospital.

use std::env;
use std::time::Duration;

use ledger_core::{HospitalPolicy, SchedulerConfig};
use once_cell::sync::Lazy;

use crate::errors::AppError;

static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenvy::dotenv();
});

/// Configuración global de la aplicación.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Intervalos de flows ejecutándose a la vez.
    pub max_workers: usize,
    pub hospital_max_discharges: u32,
    pub hospital_backoff_ms: u64,
    pub hospital_backoff_cap_ms: u64,
    /// Sin URL la aplicación usa el storage engine en memoria.
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { max_workers: 8,
               hospital_max_discharges: 3,
               hospital_backoff_ms: 100,
               hospital_backoff_cap_ms: 5_000,
               database_url: None }
    }
}

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, AppError> {
    match lookup(key) {
        Some(raw) => raw.trim()
                        .parse()
                        .map_err(|_| AppError::Config(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Lazy::force(&DOTENV_LOADED);
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con una fuente de variables arbitraria.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let d = Self::default();
        Ok(Self { max_workers: parse_or(&lookup, "LEDGER_MAX_WORKERS", d.max_workers)?,
                  hospital_max_discharges: parse_or(&lookup, "LEDGER_HOSPITAL_MAX_DISCHARGES", d.hospital_max_discharges)?,
                  hospital_backoff_ms: parse_or(&lookup, "LEDGER_HOSPITAL_BACKOFF_MS", d.hospital_backoff_ms)?,
                  hospital_backoff_cap_ms: parse_or(&lookup, "LEDGER_HOSPITAL_BACKOFF_CAP_MS", d.hospital_backoff_cap_ms)?,
                  database_url: lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()) })
    }

    pub fn hospital_policy(&self) -> HospitalPolicy {
        HospitalPolicy::default().with_max_discharges(self.hospital_max_discharges)
                                 .with_backoff(Duration::from_millis(self.hospital_backoff_ms),
                                               Duration::from_millis(self.hospital_backoff_cap_ms))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default().with_max_workers(self.max_workers)
                                  .with_hospital(self.hospital_policy())
    }
}
