//! Servicios colaboradores consumidos por la lógica de los flows: firma y
//! verificación de contratos. El core no los invoca; sólo los pone a
//! disposición de los steps a través de `FlowContext`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CoreEngineError;
use crate::hashing::{hash_value, keyed_hash, to_canonical_json};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub String);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait SigningService: Send + Sync {
    fn sign(&self, bytes: &[u8]) -> Signature;
}

/// Firmante basado en hash con clave de blake3 (tests y demo).
pub struct Blake3Signer {
    key: [u8; 32],
}

impl Blake3Signer {
    /// Deriva la clave de un identificador legible.
    pub fn from_identity(identity: &str) -> Self {
        let mut key = [0u8; 32];
        key.copy_from_slice(blake3::hash(identity.as_bytes()).as_bytes());
        Self { key }
    }

    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        keyed_hash(&self.key, bytes) == signature.0
    }
}

impl SigningService for Blake3Signer {
    fn sign(&self, bytes: &[u8]) -> Signature {
        Signature(keyed_hash(&self.key, bytes))
    }
}

/// Propuesta de transacción que se somete al verificador.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedTransaction {
    pub command: String,
    pub inputs: Vec<Value>,
    pub outputs: Vec<Value>,
    pub signers: Vec<String>,
}

impl ProposedTransaction {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into(),
               inputs: Vec::new(),
               outputs: Vec::new(),
               signers: Vec::new() }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_signer(mut self, signer: impl Into<String>) -> Self {
        self.signers.push(signer.into());
        self
    }

    /// Identificador estable: hash del JSON canónico.
    pub fn id(&self) -> Result<String, CoreEngineError> {
        let v = serde_json::to_value(self)?;
        Ok(hash_value(&v))
    }

    /// Bytes canónicos a firmar.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CoreEngineError> {
        let v = serde_json::to_value(self)?;
        Ok(to_canonical_json(&v).into_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection(pub String);

impl From<Rejection> for CoreEngineError {
    fn from(r: Rejection) -> Self {
        CoreEngineError::ContractRejected(r.0)
    }
}

/// Oráculo pass/fail de reglas de contrato.
pub trait ContractVerifier: Send + Sync {
    fn verify(&self, tx: &ProposedTransaction) -> Result<(), Rejection>;
}

type Rule = Box<dyn Fn(&ProposedTransaction) -> Result<(), String> + Send + Sync>;

/// Verificador basado en una lista de reglas evaluadas en orden.
#[derive(Default)]
pub struct RuleVerifier {
    rules: Vec<(String, Rule)>,
}

impl RuleVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule<F>(mut self, name: impl Into<String>, f: F) -> Self
        where F: Fn(&ProposedTransaction) -> Result<(), String> + Send + Sync + 'static
    {
        self.rules.push((name.into(), Box::new(f)));
        self
    }
}

impl ContractVerifier for RuleVerifier {
    fn verify(&self, tx: &ProposedTransaction) -> Result<(), Rejection> {
        for (name, rule) in &self.rules {
            rule(tx).map_err(|reason| Rejection(format!("{name}: {reason}")))?;
        }
        Ok(())
    }
}

/// Servicios compartidos por todos los flows de un scheduler.
#[derive(Clone)]
pub struct ServiceHub {
    pub signer: Arc<dyn SigningService>,
    pub verifier: Arc<dyn ContractVerifier>,
}

impl ServiceHub {
    pub fn new(signer: Arc<dyn SigningService>, verifier: Arc<dyn ContractVerifier>) -> Self {
        Self { signer, verifier }
    }
}

impl Default for ServiceHub {
    fn default() -> Self {
        Self { signer: Arc::new(Blake3Signer::from_identity("local-node")),
               verifier: Arc::new(RuleVerifier::new()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signer_verifies_own_signatures() {
        let signer = Blake3Signer::from_identity("alice");
        let sig = signer.sign(b"payload");
        assert!(signer.verify(b"payload", &sig));
        assert!(!signer.verify(b"other", &sig));
        assert!(!Blake3Signer::from_identity("bob").verify(b"payload", &sig));
    }

    #[test]
    fn rule_verifier_reports_first_failing_rule() {
        let verifier = RuleVerifier::new().rule("has-outputs", |tx| {
                                               if tx.outputs.is_empty() {
                                                   Err("no outputs".into())
                                               } else {
                                                   Ok(())
                                               }
                                           });
        let empty = ProposedTransaction::new("Issue");
        let err = verifier.verify(&empty).unwrap_err();
        assert_eq!(err.0, "has-outputs: no outputs");
        assert!(verifier.verify(&empty.with_output(json!({"amount": 10}))).is_ok());
    }

    #[test]
    fn transaction_id_is_stable() {
        let a = ProposedTransaction::new("Move").with_output(json!({"b": 1, "a": 2}));
        let b = ProposedTransaction::new("Move").with_output(json!({"a": 2, "b": 1}));
        assert_eq!(a.id().unwrap(), b.id().unwrap());
    }
}
