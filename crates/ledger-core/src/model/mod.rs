//! Modelos neutrales (ids, entidades, checkpoints).

pub mod checkpoint;
pub mod entity;
pub mod ids;

pub use checkpoint::{Checkpoint, CheckpointDraft, OutboundMessage, ResumePoint, WaitCondition};
pub use entity::{Entity, EntityRow};
pub use ids::{FlowId, ScopeId, SessionId};
