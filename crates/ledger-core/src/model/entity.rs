//! Mapeo explícito de entidades a tablas.
//!
//! Cada tipo persistible declara su tabla y versión de esquema y se
//! serializa a un `EntityRow` neutro que el storage engine consume. La
//! unicidad se impone sobre `(table, key)`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::constants::SCHEMA_VERSION_FIELD;
use crate::errors::CoreEngineError;

/// Fila neutra tal como la ve el storage engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub table: String,
    pub key: String,
    pub payload: Value,
}

impl EntityRow {
    pub fn new(table: impl Into<String>, key: impl Into<String>, payload: Value) -> Self {
        Self { table: table.into(),
               key: key.into(),
               payload }
    }

    /// Identidad lógica `(table, key)` usada para detectar colisiones.
    pub fn identity(&self) -> (String, String) {
        (self.table.clone(), self.key.clone())
    }
}

/// Tipo de dominio persistible a través de un `PersistenceScope`.
pub trait Entity: Sized + Serialize + DeserializeOwned {
    /// Tabla lógica destino.
    const TABLE: &'static str;
    /// Versión de esquema (incrementar en cambios incompatibles).
    const SCHEMA_VERSION: u32 = 1;

    /// Clave primaria estable dentro de la tabla.
    fn primary_key(&self) -> String;

    /// Serializa a fila neutra insertando la versión de esquema.
    fn to_row(&self) -> Result<EntityRow, CoreEngineError> {
        let mut payload = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut payload {
            map.entry(SCHEMA_VERSION_FIELD.to_string())
               .or_insert(Value::from(Self::SCHEMA_VERSION));
        }
        Ok(EntityRow::new(Self::TABLE, self.primary_key(), payload))
    }

    /// Decodifica una fila verificando tabla y versión.
    fn from_row(row: &EntityRow) -> Result<Self, CoreEngineError> {
        if row.table != Self::TABLE {
            return Err(CoreEngineError::Serialization(format!("row of table '{}' decoded as '{}'",
                                                              row.table,
                                                              Self::TABLE)));
        }
        let found = row.payload
                       .get(SCHEMA_VERSION_FIELD)
                       .and_then(|v| v.as_u64())
                       .map(|v| v as u32);
        if found != Some(Self::SCHEMA_VERSION) {
            return Err(CoreEngineError::Serialization(format!("schema version mismatch for {}: expected {}, found {:?}",
                                                              Self::TABLE,
                                                              Self::SCHEMA_VERSION,
                                                              found)));
        }
        Ok(serde_json::from_value(row.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Quote {
        id: i32,
        name: String,
    }

    impl Entity for Quote {
        const TABLE: &'static str = "custom_table";
        fn primary_key(&self) -> String {
            self.id.to_string()
        }
    }

    #[test]
    fn row_carries_table_key_and_version() {
        let q = Quote { id: 7, name: "Dan".into() };
        let row = q.to_row().unwrap();
        assert_eq!(row.table, "custom_table");
        assert_eq!(row.key, "7");
        assert_eq!(row.payload["schema_version"], 1);
        assert_eq!(Quote::from_row(&row).unwrap(), q);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut row = Quote { id: 1, name: "x".into() }.to_row().unwrap();
        row.payload["schema_version"] = Value::from(9);
        assert!(matches!(Quote::from_row(&row), Err(CoreEngineError::Serialization(_))));
    }
}
