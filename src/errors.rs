use ledger_core::CoreEngineError;
use ledger_persistence::PersistenceError;
use thiserror::Error;

/// Errores de la aplicación (binario y demo).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Error del motor: {0}")]
    Core(#[from] CoreEngineError),
    #[error("Error de persistencia: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Error de configuración: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_variant_wraps_engine_error() {
        let err: AppError = CoreEngineError::UnknownFlow("f1".into()).into();
        assert_eq!(err.to_string(), "Error del motor: unknown flow: f1");
    }

    #[test]
    fn config_variant_format() {
        let err = AppError::Config("LEDGER_MAX_WORKERS=abc".into());
        assert_eq!(err.to_string(), "Error de configuración: LEDGER_MAX_WORKERS=abc");
    }
}
