//! Definiciones de flow y registro por nombre.
//!
//! El `definition_hash` identifica la forma del flow (ids de steps en
//! orden); un checkpoint sólo puede reanudarse con una definición del mismo
//! hash.

use std::sync::Arc;

use dashmap::DashMap;
use log::info;
use serde_json::json;

use crate::errors::CoreEngineError;
use crate::hashing::{hash_str, to_canonical_json};
use crate::step::{FlowStep, FnStep, StepRunResult};
use crate::engine::FlowContext;

/// Definición inmutable de un flow.
pub struct FlowDefinition {
    pub name: String,
    pub steps: Vec<Box<dyn FlowStep>>,
    pub definition_hash: String,
}

impl FlowDefinition {
    pub fn builder(name: impl Into<String>) -> FlowDefinitionBuilder {
        FlowDefinitionBuilder { name: name.into(),
                                steps: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn index_of(&self, step_id: &str) -> Result<usize, CoreEngineError> {
        self.steps
            .iter()
            .position(|s| s.id() == step_id)
            .ok_or_else(|| CoreEngineError::UnknownStep(step_id.to_string()))
    }

    pub fn step_id(&self, index: usize) -> &str {
        self.steps.get(index).map(|s| s.id()).unwrap_or(END_OF_FLOW)
    }
}

impl std::fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.steps.iter().map(|s| s.id()).collect();
        f.debug_struct("FlowDefinition")
         .field("name", &self.name)
         .field("steps", &ids)
         .field("definition_hash", &self.definition_hash)
         .finish()
    }
}

/// Id de step usado en el punto de reanudación cuando no quedan steps.
pub const END_OF_FLOW: &str = "$end";

/// Hash de la forma del flow: nombre + ids de steps en orden.
pub fn definition_hash(name: &str, step_ids: &[&str]) -> String {
    hash_str(&to_canonical_json(&json!({ "name": name, "steps": step_ids })))
}

pub struct FlowDefinitionBuilder {
    name: String,
    steps: Vec<Box<dyn FlowStep>>,
}

impl FlowDefinitionBuilder {
    /// Añade un step definido por closure.
    pub fn step<F>(mut self, id: impl Into<String>, f: F) -> Self
        where F: Fn(&mut FlowContext) -> Result<StepRunResult, CoreEngineError> + Send + Sync + 'static
    {
        self.steps.push(Box::new(FnStep::new(id, f)));
        self
    }

    /// Añade un step ya construido.
    pub fn add_step<S: FlowStep + 'static>(mut self, step: S) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Ids vacíos o duplicados son un error de programación.
    pub fn build(self) -> Result<FlowDefinition, CoreEngineError> {
        let ids: Vec<&str> = self.steps.iter().map(|s| s.id()).collect();
        for (i, id) in ids.iter().enumerate() {
            if id.is_empty() || *id == END_OF_FLOW || ids[..i].contains(id) {
                return Err(CoreEngineError::Internal(format!("invalid or duplicate step id '{id}' in flow {}",
                                                             self.name)));
            }
        }
        let definition_hash = definition_hash(&self.name, &ids);
        Ok(FlowDefinition { name: self.name,
                            steps: self.steps,
                            definition_hash })
    }
}

/// Registro de definiciones por nombre, necesario para reconstruir flows
/// desde sus checkpoints tras un reinicio.
#[derive(Default)]
pub struct FlowRegistry {
    definitions: DashMap<String, Arc<FlowDefinition>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra (o reemplaza) una definición.
    pub fn register(&self, definition: Arc<FlowDefinition>) {
        info!("registry:register name={} hash={}", definition.name, definition.definition_hash);
        self.definitions.insert(definition.name.clone(), definition);
    }

    pub fn get(&self, name: &str) -> Result<Arc<FlowDefinition>, CoreEngineError> {
        self.definitions
            .get(name)
            .map(|d| d.value().clone())
            .ok_or_else(|| CoreEngineError::UnknownDefinition(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(ctx: &mut FlowContext) -> Result<StepRunResult, CoreEngineError> {
        let _ = ctx;
        Ok(StepRunResult::Continue)
    }

    #[test]
    fn hash_depends_on_step_order() {
        let a = FlowDefinition::builder("f").step("x", noop).step("y", noop).build().unwrap();
        let b = FlowDefinition::builder("f").step("y", noop).step("x", noop).build().unwrap();
        let a2 = FlowDefinition::builder("f").step("x", noop).step("y", noop).build().unwrap();
        assert_ne!(a.definition_hash, b.definition_hash);
        assert_eq!(a.definition_hash, a2.definition_hash);
        assert_eq!(a.index_of("y").unwrap(), 1);
        assert!(matches!(a.index_of("z"), Err(CoreEngineError::UnknownStep(_))));
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let r = FlowDefinition::builder("f").step("x", noop).step("x", noop).build();
        assert!(r.is_err());
    }

    #[test]
    fn registry_lookup() {
        let reg = FlowRegistry::new();
        reg.register(Arc::new(FlowDefinition::builder("issue").step("a", noop).build().unwrap()));
        assert_eq!(reg.get("issue").unwrap().len(), 1);
        assert!(matches!(reg.get("nope"), Err(CoreEngineError::UnknownDefinition(_))));
        assert_eq!(reg.names(), vec!["issue".to_string()]);
    }
}
