//! ledger-persistence
//!
//! Storage engine Postgres (Diesel + r2d2) para `ledger-core`: checkpoints
//! con compare-and-set por secuencia, tabla genérica de entidades con
//! unicidad `(table_name, entity_key)` e historias del hospital de flows.
//!
//! Módulos:
//! - `pg`: pool, proveedor de conexiones y `PgStorageEngine`.
//! - `bootstrap`: DDL idempotente de las tablas.
//! - `config`: carga de configuración desde .env.
//! - `schema`: tablas Diesel declaradas para compilar queries.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod pg;
pub mod schema;

pub use config::{init_dotenv, DbConfig};
pub use error::PersistenceError;
pub use pg::{build_dev_pool_from_env, build_pool, ConnectionProvider, PgPool, PgStorageEngine, PoolProvider};
