//! DDL idempotente de las tablas del storage engine. Se ejecuta una vez al
//! construir el pool; no hay framework de migraciones.

use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use log::debug;

use crate::error::PersistenceError;

pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS flow_checkpoints (
    flow_id    UUID        NOT NULL,
    seq        BIGINT      NOT NULL CHECK (seq >= 0),
    flow_name  TEXT        NOT NULL,
    body       JSONB       NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (flow_id, seq)
);

CREATE TABLE IF NOT EXISTS flow_entities (
    table_name TEXT  NOT NULL,
    entity_key TEXT  NOT NULL,
    payload    JSONB NOT NULL,
    PRIMARY KEY (table_name, entity_key)
);

CREATE TABLE IF NOT EXISTS hospital_records (
    flow_id       UUID        PRIMARY KEY,
    error_class   TEXT        NOT NULL,
    attempt_count INTEGER     NOT NULL CHECK (attempt_count >= 0),
    outcome       TEXT        NOT NULL CHECK (outcome IN ('discharged', 'observation', 'permanent')),
    last_error    JSONB       NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL
);
"#;

pub fn ensure_schema(conn: &mut PgConnection) -> Result<(), PersistenceError> {
    conn.batch_execute(DDL)?;
    debug!("bootstrap:schema_ready");
    Ok(())
}
