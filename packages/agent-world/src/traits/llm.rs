//! LLM collaborator.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::agent::ModelConfig;
use crate::error::ProviderError;

/// Role of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One prompt message sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: ChatRole,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Token usage of one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }

    /// Rough estimate when the provider reports nothing: one token per four
    /// characters, rounded up.
    pub fn estimate(prompt: &[LlmMessage], output: &str) -> Self {
        let input_chars: usize = prompt.iter().map(|m| m.content.chars().count()).sum();
        Self::new(
            estimate_tokens(input_chars),
            estimate_tokens(output.chars().count()),
        )
    }
}

fn estimate_tokens(chars: usize) -> u32 {
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

/// One item of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmChunk {
    /// Incremental output text.
    Text(String),
    /// Usage reported by the provider, usually last.
    Usage(Usage),
}

/// Streamed completion.
pub type LlmStream = BoxStream<'static, Result<LlmChunk, ProviderError>>;

/// Chat completion provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Start a streamed completion.
    ///
    /// An `Err` here means the call never started. Errors inside the stream
    /// mean it failed part way.
    async fn stream(
        &self,
        config: &ModelConfig,
        messages: &[LlmMessage],
    ) -> Result<LlmStream, ProviderError>;

    /// Complete without streaming. Collects the stream by default.
    async fn generate(
        &self,
        config: &ModelConfig,
        messages: &[LlmMessage],
    ) -> Result<String, ProviderError> {
        let mut stream = self.stream(config, messages).await?;
        let mut content = String::new();
        while let Some(chunk) = stream.next().await {
            if let LlmChunk::Text(text) = chunk? {
                content.push_str(&text);
            }
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_estimate_rounds_up() {
        let prompt = vec![LlmMessage::system("abcd"), LlmMessage::user("e")];
        let usage = Usage::estimate(&prompt, "hello");
        assert_eq!(usage.input_tokens, 2);
        assert_eq!(usage.output_tokens, 2);
        assert_eq!(usage.total_tokens, 4);
    }

    #[test]
    fn test_usage_estimate_empty() {
        assert_eq!(Usage::estimate(&[], ""), Usage::default());
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&LlmMessage::assistant("hi")).unwrap();
        assert!(json.contains(r#""role":"assistant""#));
    }
}
