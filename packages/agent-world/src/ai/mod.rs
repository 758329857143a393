//! LLM provider implementations.
//!
//! Reference implementations of the `LlmProvider` trait. Use these directly
//! or implement your own.

#[cfg(feature = "openai")]
mod openai;

#[cfg(feature = "openai")]
pub use openai::OpenAiProvider;
