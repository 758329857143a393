//! OpenAI implementation of the `LlmProvider` trait.
//!
//! Works with any OpenAI-compatible `/chat/completions` endpoint.
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_world::ai::OpenAiProvider;
//!
//! let provider = OpenAiProvider::new("sk-...").with_base_url("http://localhost:11434/v1");
//! let manager = WorldManager::new(storage, Arc::new(provider), settings)?;
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use openai_client::{ChatRequest, Message, OpenAIClient, OpenAIError, StreamDelta};
use tracing::debug;

use crate::agent::ModelConfig;
use crate::config::Config;
use crate::error::ProviderError;
use crate::traits::llm::{ChatRole, LlmChunk, LlmMessage, LlmProvider, LlmStream, Usage};

/// OpenAI-backed provider.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: OpenAIClient,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: OpenAIClient::new(api_key),
        }
    }

    /// Build from process configuration. Requires `OPENAI_API_KEY`.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let api_key = config
            .openai_api_key
            .clone()
            .ok_or_else(|| ProviderError::Config("OPENAI_API_KEY not set".into()))?;
        let provider = Self::new(api_key);
        Ok(match &config.openai_base_url {
            Some(url) => provider.with_base_url(url.clone()),
            None => provider,
        })
    }

    /// Set a custom base URL (for Azure, proxies, local servers, etc.).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.client = self.client.with_base_url(url);
        self
    }

    fn request(config: &ModelConfig, messages: &[LlmMessage]) -> ChatRequest {
        let mut request = ChatRequest::new(config.model.clone())
            .messages(messages.iter().map(to_wire_message).collect());
        if let Some(temperature) = config.temperature {
            request = request.temperature(temperature);
        }
        if let Some(max_tokens) = config.max_tokens {
            request = request.token_limit(max_tokens);
        }
        request
    }
}

fn to_wire_message(message: &LlmMessage) -> Message {
    match message.role {
        ChatRole::System => Message::system(message.content.clone()),
        ChatRole::User => Message::user(message.content.clone()),
        ChatRole::Assistant => Message::assistant(message.content.clone()),
    }
}

impl From<OpenAIError> for ProviderError {
    fn from(err: OpenAIError) -> Self {
        match err {
            OpenAIError::Config(msg) => ProviderError::Config(msg),
            OpenAIError::Network(msg) => ProviderError::Network(msg),
            OpenAIError::Api { status, message } => {
                ProviderError::Api(format!("{}: {}", status, message))
            }
            OpenAIError::Parse(msg) => ProviderError::Parse(msg),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn stream(
        &self,
        config: &ModelConfig,
        messages: &[LlmMessage],
    ) -> Result<LlmStream, ProviderError> {
        debug!(model = %config.model, messages = messages.len(), "opening completion stream");
        let stream = self
            .client
            .chat_completion_stream(Self::request(config, messages))
            .await?;

        let chunks = stream.filter_map(|delta| async move {
            match delta {
                Ok(StreamDelta::Content(text)) => Some(Ok(LlmChunk::Text(text))),
                Ok(StreamDelta::Usage(usage)) => Some(Ok(LlmChunk::Usage(Usage::new(
                    usage.prompt_tokens,
                    usage.completion_tokens,
                )))),
                Ok(StreamDelta::Done) => None,
                Err(e) => Some(Err(ProviderError::from(e))),
            }
        });
        Ok(chunks.boxed())
    }

    async fn generate(
        &self,
        config: &ModelConfig,
        messages: &[LlmMessage],
    ) -> Result<String, ProviderError> {
        let response = self
            .client
            .chat_completion(Self::request(config, messages))
            .await?;
        Ok(response.content)
    }
}
