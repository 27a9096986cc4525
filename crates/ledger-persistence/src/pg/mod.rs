//! Storage engine Postgres (Diesel) para el core de flows.
//!
//! - Cada intervalo de suspensión usa una conexión del pool con una
//!   transacción explícita (`BEGIN ... COMMIT`); las scopes del core se
//!   mapean a savepoints SQL.
//! - `flush` inserta en `flow_entities` bajo un savepoint interno: si falla,
//!   la transacción sigue utilizable y nada del lote queda aplicado.
//! - Los checkpoints se escriben con compare-and-set sobre la secuencia
//!   anterior (`SELECT ... FOR UPDATE`), y el PK `(flow_id, seq)` cubre la
//!   carrera del checkpoint inicial.
//! - Las lecturas fuera de transacción reintentan fallos transitorios.

use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use log::{debug, error, warn};
use serde_json::Value;
use uuid::Uuid;

use ledger_core::{Checkpoint, EntityRow, ErrorClass, FlowId, HospitalOutcome, HospitalRecord, StorageEngine, StorageError,
                  StorageTxn};

use crate::bootstrap::ensure_schema;
use crate::error::PersistenceError;
use crate::schema::{flow_checkpoints, flow_entities, hospital_records};

/// Alias de tipo para el pool r2d2 de conexiones Postgres.
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Savepoint interno que aísla cada lote de `flush`.
const FLUSH_SAVEPOINT: &str = "ledger_flush";

/// Proveedor abstracto de conexiones.
///
/// Contrato: devuelve una conexión válida o `PersistenceError::TransientIo`
/// si el pool no puede entregarla.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError>;
}

/// Implementación concreta de `ConnectionProvider` respaldada por un `PgPool`.
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = flow_entities)]
struct NewEntityRow<'a> {
    table_name: &'a str,
    entity_key: &'a str,
    payload: &'a Value,
}

#[derive(Queryable, Debug)]
struct EntityRecord {
    table_name: String,
    entity_key: String,
    payload: Value,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = flow_checkpoints)]
struct NewCheckpointRow<'a> {
    flow_id: Uuid,
    seq: i64,
    flow_name: &'a str,
    body: &'a Value,
    created_at: DateTime<Utc>,
}

/// Fila de `hospital_records`; `last_error` guarda el error serializado.
#[derive(Insertable, AsChangeset, Queryable, Debug)]
#[diesel(table_name = hospital_records)]
#[diesel(primary_key(flow_id))]
struct HospitalRow {
    flow_id: Uuid,
    error_class: String,
    attempt_count: i32,
    outcome: String,
    last_error: Value,
    updated_at: DateTime<Utc>,
}

impl HospitalRow {
    fn from_record(r: &HospitalRecord) -> Result<Self, PersistenceError> {
        let attempt_count = i32::try_from(r.attempt_count).map_err(|e| PersistenceError::Decode(format!("attempt_count: {e}")))?;
        Ok(Self { flow_id: r.flow_id.as_uuid(),
                  error_class: r.error_class.as_str().to_string(),
                  attempt_count,
                  outcome: r.outcome.as_str().to_string(),
                  last_error: serde_json::to_value(&r.last_error)?,
                  updated_at: r.updated_at })
    }

    fn into_record(self) -> Result<HospitalRecord, PersistenceError> {
        let error_class = ErrorClass::parse(&self.error_class).ok_or_else(|| {
                              PersistenceError::Decode(format!("unknown error class '{}'", self.error_class))
                          })?;
        let outcome = HospitalOutcome::parse(&self.outcome).ok_or_else(|| {
                          PersistenceError::Decode(format!("unknown hospital outcome '{}'", self.outcome))
                      })?;
        let attempt_count = u32::try_from(self.attempt_count).map_err(|e| PersistenceError::Decode(format!("attempt_count: {e}")))?;
        Ok(HospitalRecord { flow_id: FlowId::from_uuid(self.flow_id),
                            error_class,
                            attempt_count,
                            outcome,
                            last_error: serde_json::from_value(self.last_error)?,
                            updated_at: self.updated_at })
    }
}

/// Determina si un error es transitorio (recomendado reintentar con backoff).
fn is_retryable(e: &PersistenceError) -> bool {
    match e {
        PersistenceError::SerializationConflict => true,
        PersistenceError::TransientIo(_) => true,
        // algunos drivers reportan desconexiones sólo por texto
        PersistenceError::Unknown(msg) => {
            let m = msg.to_lowercase();
            m.contains("deadlock detected")
            || m.contains("terminating connection due to administrator command")
            || m.contains("connection closed")
            || m.contains("connection refused")
            || m.contains("timeout")
        }
        _ => false,
    }
}

/// Retry simple con backoff lineal corto (hasta 3 reintentos: 15ms, 30ms,
/// 45ms). Sólo se usa en lecturas y en la apertura de transacciones.
fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("retryable error (attempt {}): {:?} -> sleeping {}ms",
                      attempts + 1,
                      e,
                      delay_ms);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

fn db(e: DieselError) -> StorageError {
    PersistenceError::from(e).into()
}

fn seq_to_i64(seq: u64) -> Result<i64, StorageError> {
    i64::try_from(seq).map_err(|e| StorageError::Backend(format!("sequence out of range: {e}")))
}

/// Los nombres de savepoint llegan del core; se validan antes de
/// interpolarlos en SQL.
fn savepoint_ident(name: &str) -> Result<&str, StorageError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StorageError::Backend(format!("invalid savepoint name '{name}'")))
    }
}

/// Transacción Postgres de un intervalo de suspensión. Soltarla sin
/// `commit` emite `ROLLBACK`.
pub struct PgTxn {
    conn: PgPooledConnection,
    finished: bool,
}

impl PgTxn {
    fn begin(mut conn: PgPooledConnection) -> Result<Self, PersistenceError> {
        conn.batch_execute("BEGIN ISOLATION LEVEL READ COMMITTED")?;
        Ok(Self { conn,
                  finished: false })
    }

    fn exec(&mut self, sql: &str) -> Result<(), StorageError> {
        self.conn.batch_execute(sql).map_err(db)
    }

    fn current_seq(&mut self, flow_id: Uuid, lock: bool) -> Result<Option<u64>, StorageError> {
        let query = flow_checkpoints::table.filter(flow_checkpoints::flow_id.eq(flow_id))
                                           .select(flow_checkpoints::seq)
                                           .order(flow_checkpoints::seq.desc())
                                           .limit(1);
        let found: Option<i64> = if lock {
            query.for_update().get_result(&mut *self.conn).optional().map_err(db)?
        } else {
            query.get_result(&mut *self.conn).optional().map_err(db)?
        };
        Ok(found.map(|s| s as u64))
    }
}

impl Drop for PgTxn {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.batch_execute("ROLLBACK") {
                warn!("txn:rollback_on_drop failed err={}", e);
            }
        }
    }
}

impl StorageTxn for PgTxn {
    fn savepoint(&mut self, name: &str) -> Result<(), StorageError> {
        let name = savepoint_ident(name)?;
        self.exec(&format!("SAVEPOINT {name}"))
    }

    fn release_savepoint(&mut self, name: &str) -> Result<(), StorageError> {
        let name = savepoint_ident(name)?;
        self.exec(&format!("RELEASE SAVEPOINT {name}"))
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StorageError> {
        let name = savepoint_ident(name)?;
        self.exec(&format!("ROLLBACK TO SAVEPOINT {name}"))
    }

    fn flush(&mut self, rows: &[EntityRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.exec(&format!("SAVEPOINT {FLUSH_SAVEPOINT}"))?;
        for row in rows {
            let new = NewEntityRow { table_name: &row.table,
                                     entity_key: &row.key,
                                     payload: &row.payload };
            let inserted = diesel::insert_into(flow_entities::table).values(&new)
                                                                    .execute(&mut *self.conn);
            if let Err(e) = inserted {
                self.exec(&format!("ROLLBACK TO SAVEPOINT {FLUSH_SAVEPOINT}"))?;
                self.exec(&format!("RELEASE SAVEPOINT {FLUSH_SAVEPOINT}"))?;
                return Err(match e {
                    DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                        debug!("flush:violation table={} key={}", row.table, row.key);
                        StorageError::ConstraintViolation { table: row.table.clone(),
                                                            key: row.key.clone(),
                                                            detail: info.message().to_string() }
                    }
                    other => db(other),
                });
            }
        }
        self.exec(&format!("RELEASE SAVEPOINT {FLUSH_SAVEPOINT}"))
    }

    fn write_checkpoint(&mut self, checkpoint: &Checkpoint, previous: Option<u64>) -> Result<(), StorageError> {
        let flow_id = checkpoint.flow_id.as_uuid();
        let current = self.current_seq(flow_id, true)?;
        if current != previous {
            return Err(StorageError::StaleCheckpoint { flow_id: checkpoint.flow_id,
                                                       expected: previous,
                                                       found: current });
        }
        if let Some(prev) = previous {
            diesel::delete(flow_checkpoints::table.filter(flow_checkpoints::flow_id.eq(flow_id))
                                                  .filter(flow_checkpoints::seq.eq(seq_to_i64(prev)?)))
            .execute(&mut *self.conn)
            .map_err(db)?;
        }
        let body = serde_json::to_value(checkpoint).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let row = NewCheckpointRow { flow_id,
                                     seq: seq_to_i64(checkpoint.seq)?,
                                     flow_name: &checkpoint.flow_name,
                                     body: &body,
                                     created_at: checkpoint.created_at };
        match diesel::insert_into(flow_checkpoints::table).values(&row)
                                                          .execute(&mut *self.conn)
        {
            Ok(_) => {
                debug!("checkpoint:write flow_id={} seq={}", checkpoint.flow_id, checkpoint.seq);
                Ok(())
            }
            // otro nodo confirmó el checkpoint inicial primero
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Err(StorageError::StaleCheckpoint { flow_id: checkpoint.flow_id,
                                                    expected: previous,
                                                    found: Some(checkpoint.seq) })
            }
            Err(e) => Err(db(e)),
        }
    }

    fn remove_checkpoint(&mut self, flow_id: FlowId, expected_seq: u64) -> Result<(), StorageError> {
        let id = flow_id.as_uuid();
        let removed = diesel::delete(flow_checkpoints::table.filter(flow_checkpoints::flow_id.eq(id))
                                                            .filter(flow_checkpoints::seq.eq(seq_to_i64(expected_seq)?)))
                      .execute(&mut *self.conn)
                      .map_err(db)?;
        if removed == 0 {
            let found = self.current_seq(id, false)?;
            return Err(StorageError::StaleCheckpoint { flow_id,
                                                       expected: Some(expected_seq),
                                                       found });
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.exec("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.exec("ROLLBACK")
    }
}

/// Storage engine Postgres sobre un `ConnectionProvider`.
pub struct PgStorageEngine<P: ConnectionProvider = PoolProvider> {
    pub provider: P,
}

impl<P: ConnectionProvider> PgStorageEngine<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl PgStorageEngine<PoolProvider> {
    pub fn from_pool(pool: PgPool) -> Self {
        Self::new(PoolProvider { pool })
    }
}

impl<P: ConnectionProvider> StorageEngine for PgStorageEngine<P> {
    fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError> {
        let txn = with_retry(|| PgTxn::begin(self.provider.connection()?))?;
        Ok(Box::new(txn))
    }

    fn read_committed(&self, table: &str) -> Result<Vec<EntityRow>, StorageError> {
        let rows: Vec<EntityRecord> = with_retry(|| {
                                          let mut conn = self.provider.connection()?;
                                          flow_entities::table.filter(flow_entities::table_name.eq(table))
                                                              .order(flow_entities::entity_key.asc())
                                                              .load(&mut conn)
                                                              .map_err(PersistenceError::from)
                                      })?;
        Ok(rows.into_iter()
               .map(|r| EntityRow::new(r.table_name, r.entity_key, r.payload))
               .collect())
    }

    fn load_checkpoint(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, StorageError> {
        let body: Option<Value> = with_retry(|| {
                                      let mut conn = self.provider.connection()?;
                                      flow_checkpoints::table.filter(flow_checkpoints::flow_id.eq(flow_id.as_uuid()))
                                                             .select(flow_checkpoints::body)
                                                             .order(flow_checkpoints::seq.desc())
                                                             .first(&mut conn)
                                                             .optional()
                                                             .map_err(PersistenceError::from)
                                  })?;
        match body {
            Some(b) => Ok(Some(serde_json::from_value(b).map_err(|e| StorageError::Serialization(e.to_string()))?)),
            None => Ok(None),
        }
    }

    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError> {
        let rows: Vec<(Uuid, i64, Value)> = with_retry(|| {
                                                let mut conn = self.provider.connection()?;
                                                flow_checkpoints::table.select((flow_checkpoints::flow_id,
                                                                                flow_checkpoints::seq,
                                                                                flow_checkpoints::body))
                                                                       .order(flow_checkpoints::created_at.asc())
                                                                       .load(&mut conn)
                                                                       .map_err(PersistenceError::from)
                                            })?;
        let mut out = Vec::with_capacity(rows.len());
        for (flow_id, seq, body) in rows {
            match serde_json::from_value::<Checkpoint>(body) {
                Ok(cp) => out.push(cp),
                Err(e) => error!("list_checkpoints:undecodable flow_id={flow_id} seq={seq} err={e}"),
            }
        }
        debug!("list_checkpoints:done count={}", out.len());
        Ok(out)
    }

    fn upsert_hospital_record(&self, record: &HospitalRecord) -> Result<(), StorageError> {
        let row = HospitalRow::from_record(record)?;
        let mut conn = self.provider.connection()?;
        diesel::insert_into(hospital_records::table).values(&row)
                                                    .on_conflict(hospital_records::flow_id)
                                                    .do_update()
                                                    .set(&row)
                                                    .execute(&mut conn)
                                                    .map_err(db)?;
        Ok(())
    }

    fn remove_hospital_record(&self, flow_id: FlowId) -> Result<(), StorageError> {
        let mut conn = self.provider.connection()?;
        diesel::delete(hospital_records::table.filter(hospital_records::flow_id.eq(flow_id.as_uuid())))
        .execute(&mut conn)
        .map_err(db)?;
        Ok(())
    }

    fn hospital_records(&self) -> Result<Vec<HospitalRecord>, StorageError> {
        let rows: Vec<HospitalRow> = with_retry(|| {
                                         let mut conn = self.provider.connection()?;
                                         hospital_records::table.order(hospital_records::updated_at.asc())
                                                                .load(&mut conn)
                                                                .map_err(PersistenceError::from)
                                     })?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.into_record()?);
        }
        Ok(out)
    }
}

/// Construye un pool Postgres r2d2 a partir de URL y asegura el esquema.
///
/// - Si `min_size > max_size`, usa `min_size = max_size`.
/// - Devuelve `PersistenceError::TransientIo` ante errores del pool/manager.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = if min_size == 0 { 1 } else { min_size };
    let validated_max = if max_size == 0 { 1 } else { max_size };
    if validated_min > validated_max {
        warn!("min_size > max_size ({} > {}), ajustando min=max",
              validated_min, validated_max);
    }
    let final_min = validated_min.min(validated_max);
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(final_min))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for bootstrap: {e}")))?;
        ensure_schema(&mut conn)?;
    }
    Ok(pool)
}

/// Helper de desarrollo: carga `.env`, lee configuración (DATABASE_URL,
/// tamaños) y construye un pool con el esquema listo.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    let cfg = crate::config::DbConfig::from_env()?;
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}
