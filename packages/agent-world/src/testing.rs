//! Testing utilities including mock implementations.
//!
//! Useful for exercising worlds without real model calls:
//! - `ScriptedProvider` - deterministic replies per model id, call tracking
//! - `EventRecorder` - collects everything a world bus carried
//! - `CountingStorage` - storage wrapper counting and timing chat writes
//! - `settle` - wait for a world to go idle, with a timeout

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use tokio::sync::{broadcast, Notify};

use crate::agent::{AgentRecord, ModelConfig};
use crate::chat::{ChatSnapshot, ChatSummary};
use crate::error::ProviderError;
use crate::events::{NoticeKind, StreamEvent, SystemNotice, WorldEvent, WorldMessage};
use crate::traits::llm::{LlmChunk, LlmMessage, LlmProvider, LlmStream, Usage};
use crate::traits::storage::{StorageResult, WorldStorage};
use crate::world::{World, WorldRecord};

/// Scripted behavior of one model call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Whole reply as one chunk.
    Text(String),
    /// Reply split into chunks, optionally with reported usage.
    Chunks {
        chunks: Vec<String>,
        usage: Option<Usage>,
    },
    /// The call fails before streaming starts.
    Fail(String),
    /// Some chunks arrive, then the stream errors.
    FailMidStream { chunks: Vec<String>, error: String },
    /// The call waits until `release` is notified, then replies with `text`.
    AfterRelease { release: Arc<Notify>, text: String },
}

/// Record of a call made to the scripted provider.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub model: String,
    pub messages: Vec<LlmMessage>,
}

/// A mock LLM provider for testing.
///
/// Replies are looked up by `ModelConfig::model`, so giving every test agent
/// its own model id scripts agents independently. One-shot replies are used
/// before the standing reply for a model; the default reply covers models
/// without a script.
#[derive(Default)]
pub struct ScriptedProvider {
    standing: Arc<RwLock<HashMap<String, Reply>>>,
    queued: Arc<RwLock<HashMap<String, VecDeque<Reply>>>>,
    default: Arc<RwLock<Option<Reply>>>,
    calls: Arc<RwLock<Vec<ProviderCall>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` on every call for `model`.
    pub fn reply(self, model: impl Into<String>, reply: Reply) -> Self {
        self.set_reply(model, reply);
        self
    }

    /// Reply with `reply` on the next call for `model` only.
    pub fn reply_once(self, model: impl Into<String>, reply: Reply) -> Self {
        self.push_reply(model, reply);
        self
    }

    /// Reply for models without a script.
    pub fn default_reply(self, reply: Reply) -> Self {
        *self.default.write().unwrap() = Some(reply);
        self
    }

    /// Change the standing reply of a model after construction.
    pub fn set_reply(&self, model: impl Into<String>, reply: Reply) {
        self.standing.write().unwrap().insert(model.into(), reply);
    }

    /// Queue a one-shot reply after construction.
    pub fn push_reply(&self, model: impl Into<String>, reply: Reply) {
        self.queued
            .write()
            .unwrap()
            .entry(model.into())
            .or_default()
            .push_back(reply);
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.read().unwrap().clone()
    }

    /// Number of calls for a model.
    pub fn call_count(&self, model: &str) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.model == model)
            .count()
    }

    /// Prompt of the most recent call for a model.
    pub fn last_prompt(&self, model: &str) -> Option<Vec<LlmMessage>> {
        self.calls
            .read()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.model == model)
            .map(|c| c.messages.clone())
    }

    fn next_reply(&self, model: &str) -> Option<Reply> {
        if let Some(reply) = self
            .queued
            .write()
            .unwrap()
            .get_mut(model)
            .and_then(|q| q.pop_front())
        {
            return Some(reply);
        }
        if let Some(reply) = self.standing.read().unwrap().get(model) {
            return Some(reply.clone());
        }
        self.default.read().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn stream(
        &self,
        config: &ModelConfig,
        messages: &[LlmMessage],
    ) -> Result<LlmStream, ProviderError> {
        self.calls.write().unwrap().push(ProviderCall {
            model: config.model.clone(),
            messages: messages.to_vec(),
        });

        let reply = self.next_reply(&config.model).ok_or_else(|| {
            ProviderError::Config(format!("no scripted reply for model {}", config.model))
        })?;
        let reply = match reply {
            Reply::AfterRelease { release, text } => {
                release.notified().await;
                Reply::Text(text)
            }
            other => other,
        };

        let items: Vec<Result<LlmChunk, ProviderError>> = match reply {
            Reply::Text(text) => vec![Ok(LlmChunk::Text(text))],
            Reply::Chunks { chunks, usage } => chunks
                .into_iter()
                .map(|c| Ok(LlmChunk::Text(c)))
                .chain(usage.map(|u| Ok(LlmChunk::Usage(u))))
                .collect(),
            Reply::Fail(error) => return Err(ProviderError::Api(error)),
            Reply::FailMidStream { chunks, error } => chunks
                .into_iter()
                .map(|c| Ok(LlmChunk::Text(c)))
                .chain(std::iter::once(Err(ProviderError::Network(error))))
                .collect(),
            Reply::AfterRelease { text, .. } => vec![Ok(LlmChunk::Text(text))],
        };

        Ok(stream::iter(items).boxed())
    }
}

/// Collects every message and event a world bus carries.
///
/// Create it before publishing; call [`EventRecorder::drain`] after the
/// world settled.
pub struct EventRecorder {
    message_rx: broadcast::Receiver<WorldMessage>,
    event_rx: broadcast::Receiver<WorldEvent>,
    messages: Vec<WorldMessage>,
    events: Vec<WorldEvent>,
}

impl EventRecorder {
    pub fn new(world: &World) -> Self {
        Self {
            message_rx: world.bus().subscribe_messages(),
            event_rx: world.bus().subscribe_events(),
            messages: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Pull everything delivered so far.
    pub fn drain(&mut self) -> &mut Self {
        while let Ok(message) = self.message_rx.try_recv() {
            self.messages.push(message);
        }
        while let Ok(event) = self.event_rx.try_recv() {
            self.events.push(event);
        }
        self
    }

    pub fn messages(&self) -> &[WorldMessage] {
        &self.messages
    }

    /// Messages published by `sender`.
    pub fn messages_from(&self, sender: &str) -> Vec<&WorldMessage> {
        self.messages.iter().filter(|m| m.sender == sender).collect()
    }

    pub fn events(&self) -> &[WorldEvent] {
        &self.events
    }

    pub fn stream_events(&self) -> Vec<&StreamEvent> {
        self.events.iter().filter_map(|e| e.as_stream()).collect()
    }

    pub fn notices(&self, kind: NoticeKind) -> Vec<&SystemNotice> {
        self.events
            .iter()
            .filter_map(|e| e.as_notice())
            .filter(|n| n.kind == kind)
            .collect()
    }
}

/// Storage wrapper that counts chat snapshot writes.
///
/// `with_write_delay` stretches every `save_chat` so overlapping writers
/// would show up in [`CountingStorage::max_concurrent_saves`].
pub struct CountingStorage {
    inner: Arc<dyn WorldStorage>,
    write_delay: Duration,
    saves: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl CountingStorage {
    pub fn new(inner: Arc<dyn WorldStorage>) -> Self {
        Self {
            inner,
            write_delay: Duration::ZERO,
            saves: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Completed and running `save_chat` calls.
    pub fn chat_saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Most `save_chat` calls ever running at once.
    pub fn max_concurrent_saves(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorldStorage for CountingStorage {
    async fn load_world(&self, world_id: &str) -> StorageResult<Option<WorldRecord>> {
        self.inner.load_world(world_id).await
    }

    async fn save_world(&self, world: &WorldRecord) -> StorageResult<()> {
        self.inner.save_world(world).await
    }

    async fn list_worlds(&self) -> StorageResult<Vec<WorldRecord>> {
        self.inner.list_worlds().await
    }

    async fn load_agent(
        &self,
        world_id: &str,
        agent_id: &str,
    ) -> StorageResult<Option<AgentRecord>> {
        self.inner.load_agent(world_id, agent_id).await
    }

    async fn save_agent(&self, world_id: &str, agent: &AgentRecord) -> StorageResult<()> {
        self.inner.save_agent(world_id, agent).await
    }

    async fn list_agents(&self, world_id: &str) -> StorageResult<Vec<AgentRecord>> {
        self.inner.list_agents(world_id).await
    }

    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> StorageResult<bool> {
        self.inner.delete_agent(world_id, agent_id).await
    }

    async fn load_chat(
        &self,
        world_id: &str,
        chat_id: &str,
    ) -> StorageResult<Option<ChatSnapshot>> {
        self.inner.load_chat(world_id, chat_id).await
    }

    async fn save_chat(&self, snapshot: &ChatSnapshot) -> StorageResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        let result = self.inner.save_chat(snapshot).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn list_chats(&self, world_id: &str) -> StorageResult<Vec<ChatSummary>> {
        self.inner.list_chats(world_id).await
    }

    async fn delete_chat(&self, world_id: &str, chat_id: &str) -> StorageResult<bool> {
        self.inner.delete_chat(world_id, chat_id).await
    }
}

/// Wait until the world has no pending deliveries. Panics after 5 seconds.
pub async fn settle(world: &World) {
    tokio::time::timeout(Duration::from_secs(5), world.wait_idle())
        .await
        .expect("world did not settle within 5s");
}
