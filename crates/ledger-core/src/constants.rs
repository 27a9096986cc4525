//! Constantes del motor core.
//!
//! Algunos valores participan en el fingerprint de los checkpoints; cambiarlos
//! invalida la verificación de checkpoints ya persistidos.

/// Versión lógica del motor. Se incluye en el fingerprint de cada
/// `Checkpoint` para que un cambio de versión incompatible sea detectable al
/// reanudar.
pub const ENGINE_VERSION: &str = "L1.0";

/// Clave reservada en los locals capturados para el input inicial del flow.
pub const INPUT_LOCAL: &str = "$input";

/// Prefijo de los savepoints que respaldan cada `PersistenceScope`.
pub const SCOPE_SAVEPOINT_PREFIX: &str = "flow_scope_";

/// Campo con la versión de esquema embebido en el payload de cada entidad.
pub const SCHEMA_VERSION_FIELD: &str = "schema_version";
