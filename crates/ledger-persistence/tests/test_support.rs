#![allow(dead_code)]

use ledger_persistence::config::DbConfig;
use ledger_persistence::pg::{build_pool, PgPool, PgStorageEngine};
use once_cell::sync::Lazy;

pub static TEST_POOL: Lazy<Option<PgPool>> = Lazy::new(|| {
    if std::env::var("DATABASE_URL").is_err() {
        return None;
    }
    let cfg = DbConfig::from_env().ok()?;
    match build_pool(&cfg.url, 1, 4) {
        Ok(p) => Some(p),
        Err(e) => {
            eprintln!("No se pudo construir pool de test: {e}");
            None
        }
    }
});

pub fn with_pool<F, R>(f: F) -> Option<R>
    where F: FnOnce(&PgPool) -> R
{
    TEST_POOL.as_ref().map(f)
}

/// Engine sobre el pool compartido; `None` (y aviso) sin DATABASE_URL.
pub fn engine() -> Option<PgStorageEngine> {
    let engine = with_pool(|p| PgStorageEngine::from_pool(p.clone()));
    if engine.is_none() {
        eprintln!("DATABASE_URL no definido: omitiendo test");
    }
    engine
}

/// Tabla lógica única por test para no colisionar entre ejecuciones.
pub fn scratch_table(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}
