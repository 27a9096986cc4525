//! ledgerflow: binario de demostración sobre `ledger-core`.
//!
//! - `config`: configuración de la aplicación desde el entorno.
//! - `demo`: flows de ejemplo (escenarios de scopes y flows de ledger).
//! - `errors`: error de nivel aplicación.

pub mod config;
pub mod demo;
pub mod errors;
