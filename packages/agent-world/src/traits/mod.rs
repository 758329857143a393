//! Collaborator traits.
//!
//! The routing core depends on two narrow interfaces it does not implement
//! itself:
//! - `LlmProvider`: streaming chat completions
//! - `WorldStorage`: world, agent and chat persistence
//!
//! Reference implementations live in [`crate::stores`] and [`crate::ai`].

pub mod llm;
pub mod storage;

pub use llm::{ChatRole, LlmChunk, LlmMessage, LlmProvider, LlmStream, Usage};
pub use storage::{StorageResult, WorldStorage};
