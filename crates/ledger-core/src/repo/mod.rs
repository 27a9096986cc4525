pub mod types;

pub use types::{definition_hash, FlowDefinition, FlowDefinitionBuilder, FlowRegistry, END_OF_FLOW};
