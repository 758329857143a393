//! Turns a streamed model response into world events.
//!
//! One run emits, on the world bus:
//!
//! ```text
//! start → chunk* → end | error
//! ```
//!
//! Every event carries the agent id and the message id of the response, so
//! observers can reassemble concurrent responses independently.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use crate::agent::ModelConfig;
use crate::bus::EventBus;
use crate::types::MessageId;
use crate::error::ProviderError;
use crate::events::{StreamEvent, StreamKind};
use crate::traits::llm::{LlmChunk, LlmMessage, LlmProvider, Usage};

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub message_id: MessageId,
    pub content: String,
    pub usage: Usage,
}

/// Runs one response attempt. Holds no state between runs.
#[derive(Clone)]
pub struct StreamingCoordinator {
    bus: EventBus,
    provider: Arc<dyn LlmProvider>,
}

impl StreamingCoordinator {
    pub fn new(bus: EventBus, provider: Arc<dyn LlmProvider>) -> Self {
        Self { bus, provider }
    }

    /// Stream a completion for `agent_id`, publishing every step.
    ///
    /// Exactly one terminal event (`end` or `error`) is published per call.
    pub async fn run(
        &self,
        agent_id: &str,
        config: &ModelConfig,
        prompt: &[LlmMessage],
        message_id: MessageId,
    ) -> Result<Completion, ProviderError> {
        self.emit(agent_id, message_id, StreamKind::Start);

        match self.consume(agent_id, config, prompt, message_id).await {
            Ok((content, reported)) => {
                let usage = reported.unwrap_or_else(|| Usage::estimate(prompt, &content));
                debug!(
                    agent_id = %agent_id,
                    message_id = %message_id,
                    output_tokens = usage.output_tokens,
                    "stream finished"
                );
                self.emit(
                    agent_id,
                    message_id,
                    StreamKind::End {
                        content: content.clone(),
                        usage,
                    },
                );
                Ok(Completion {
                    message_id,
                    content,
                    usage,
                })
            }
            Err(e) => {
                warn!(agent_id = %agent_id, message_id = %message_id, error = %e, "stream failed");
                self.emit(
                    agent_id,
                    message_id,
                    StreamKind::Error {
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn consume(
        &self,
        agent_id: &str,
        config: &ModelConfig,
        prompt: &[LlmMessage],
        message_id: MessageId,
    ) -> Result<(String, Option<Usage>), ProviderError> {
        let mut stream = self.provider.stream(config, prompt).await?;
        let mut content = String::new();
        let mut usage = None;

        while let Some(chunk) = stream.next().await {
            match chunk? {
                LlmChunk::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    content.push_str(&text);
                    self.emit(agent_id, message_id, StreamKind::Chunk { content: text });
                }
                LlmChunk::Usage(reported) => usage = Some(reported),
            }
        }

        Ok((content, usage))
    }

    fn emit(&self, agent_id: &str, message_id: MessageId, kind: StreamKind) {
        self.bus.publish_event(StreamEvent {
            world_id: self.bus.world_id().to_string(),
            agent_id: agent_id.to_string(),
            message_id,
            kind,
        });
    }
}
