//! Worlds: isolated conversational spaces.
//!
//! A [`World`] owns its agents, its bus and one pipeline task per agent.
//! Cloning a `World` is cheap and shares everything.
//!
//! # Locks
//!
//! - `registry` (publish sequence + pipeline inboxes) is taken before `state`
//!   when both are needed. Dispatch holds it while queueing, so every
//!   pipeline sees messages in publish order.
//! - `state` (agents, memory, active chat) is only held for synchronous
//!   mutations, never across an `.await`.
//! - `snapshot` (async) serializes chat snapshot writes for this world.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::agent::{Agent, AgentStatus, ModelConfig};
use crate::bus::{EventBus, Subscription};
use crate::chat::SnapshotState;
use crate::config::WorldSettings;
use crate::types::{id_from_name, AgentId, ChatId, Message, MessageId, Sender, WorldId};
use crate::error::{Result, WorldError};
use crate::events::{WorldEvent, WorldMessage};
use crate::pipeline::{self, PipelineHandle};
use crate::traits::llm::LlmProvider;

/// World as stored by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldRecord {
    pub id: WorldId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub turn_limit: u32,
    #[serde(default)]
    pub active_chat_id: Option<ChatId>,
    pub created_at: DateTime<Utc>,
}

impl WorldRecord {
    /// Fresh record for a world named `name`.
    pub fn new(name: impl Into<String>, turn_limit: u32) -> Self {
        let name = name.into();
        Self {
            id: id_from_name(&name),
            name: name.trim().to_string(),
            description: None,
            turn_limit,
            active_chat_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A running world.
#[derive(Clone)]
pub struct World {
    pub(crate) inner: Arc<WorldInner>,
}

pub(crate) struct WorldInner {
    pub(crate) id: WorldId,
    pub(crate) name: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) settings: WorldSettings,
    pub(crate) bus: EventBus,
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) activity: ActivityTracker,
    pub(crate) snapshot: tokio::sync::Mutex<SnapshotState>,
    state: Mutex<WorldState>,
    registry: Mutex<Registry>,
    cycles: watch::Sender<u64>,
    autosave: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct WorldState {
    pub(crate) description: Option<String>,
    pub(crate) turn_limit: u32,
    pub(crate) active_chat_id: Option<ChatId>,
    /// Bumped whenever agent memory is swapped for another chat.
    pub(crate) chat_epoch: u64,
    pub(crate) agents: IndexMap<AgentId, Agent>,
}

#[derive(Default)]
struct Registry {
    /// Sequence number of the last dispatched message.
    seq: u64,
    pipelines: HashMap<AgentId, PipelineHandle>,
}

fn recover<'a, T>(
    result: std::sync::LockResult<MutexGuard<'a, T>>,
    world_id: &str,
    what: &str,
) -> MutexGuard<'a, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(world_id = %world_id, lock = what, "mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl WorldInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, WorldState> {
        recover(self.state.lock(), &self.id, "state")
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        recover(self.registry.lock(), &self.id, "registry")
    }

    /// Assign the next sequence number, queue the message in every pipeline
    /// inbox (one counted delivery each), then hand it to bus observers.
    pub(crate) fn dispatch(&self, mut message: WorldMessage) -> MessageId {
        message.world_id = self.id.clone();
        let id = message.id;

        let mut registry = self.lock_registry();
        registry.seq += 1;
        message.seq = registry.seq;

        self.activity.inc(registry.pipelines.len());
        let mut stopped = 0;
        for handle in registry.pipelines.values() {
            if !handle.deliver(message.clone()) {
                stopped += 1;
            }
        }
        if stopped > 0 {
            self.activity.dec(stopped);
        }
        let observers = self.bus.publish_message(message);

        debug!(
            world_id = %self.id,
            message_id = %id,
            seq = registry.seq,
            pipelines = registry.pipelines.len() - stopped,
            observers,
            "message dispatched"
        );
        id
    }

    /// Signal that a pipeline finished a processing cycle.
    pub(crate) fn bump_cycle(&self) {
        self.cycles.send_modify(|c| *c = c.wrapping_add(1));
    }
}

impl Drop for WorldInner {
    fn drop(&mut self) {
        let autosave = match self.autosave.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = autosave {
            handle.abort();
        }
    }
}

impl World {
    /// Create an empty world named `name` with the default turn limit.
    pub fn new(
        name: impl Into<String>,
        settings: WorldSettings,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Self> {
        let record = WorldRecord::new(name, settings.default_turn_limit);
        Self::from_record(record, settings, provider)
    }

    /// Build a world from its record. Agents are added separately.
    pub fn from_record(
        record: WorldRecord,
        settings: WorldSettings,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Self> {
        settings.validate()?;
        if record.id.is_empty() {
            return Err(WorldError::InvalidConfig(format!(
                "world name {:?} has no usable characters",
                record.name
            )));
        }
        validate_turn_limit(record.turn_limit)?;

        let (cycles, _) = watch::channel(0);
        let inner = WorldInner {
            bus: EventBus::with_capacity(record.id.clone(), settings.bus_capacity),
            id: record.id,
            name: record.name,
            created_at: record.created_at,
            settings,
            provider,
            activity: ActivityTracker::new(),
            snapshot: tokio::sync::Mutex::new(SnapshotState::default()),
            state: Mutex::new(WorldState {
                description: record.description,
                turn_limit: record.turn_limit,
                active_chat_id: record.active_chat_id,
                chat_epoch: 0,
                agents: IndexMap::new(),
            }),
            registry: Mutex::new(Registry::default()),
            cycles,
            autosave: Mutex::new(None),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn settings(&self) -> &WorldSettings {
        &self.inner.settings
    }

    pub fn turn_limit(&self) -> u32 {
        self.inner.lock_state().turn_limit
    }

    pub fn set_turn_limit(&self, turn_limit: u32) -> Result<()> {
        validate_turn_limit(turn_limit)?;
        self.inner.lock_state().turn_limit = turn_limit;
        Ok(())
    }

    pub fn description(&self) -> Option<String> {
        self.inner.lock_state().description.clone()
    }

    pub fn set_description(&self, description: Option<String>) {
        self.inner.lock_state().description = description;
    }

    pub fn active_chat_id(&self) -> Option<ChatId> {
        self.inner.lock_state().active_chat_id.clone()
    }

    /// Persistable view of the world.
    pub fn record(&self) -> WorldRecord {
        let state = self.inner.lock_state();
        WorldRecord {
            id: self.inner.id.clone(),
            name: self.inner.name.clone(),
            description: state.description.clone(),
            turn_limit: state.turn_limit,
            active_chat_id: state.active_chat_id.clone(),
            created_at: self.inner.created_at,
        }
    }

    // =========================================================================
    // Agents
    // =========================================================================

    /// Register an agent and start its pipeline.
    ///
    /// Fails with `DuplicateAgentName` when the id or the (case-insensitive)
    /// name is taken. The agent sees only messages published after this call.
    pub fn add_agent(&self, agent: Agent) -> Result<()> {
        let agent_id = agent.id.clone();

        let mut registry = self.inner.lock_registry();
        {
            let mut state = self.inner.lock_state();
            let taken = state.agents.contains_key(&agent.id)
                || state
                    .agents
                    .values()
                    .any(|a| a.name.eq_ignore_ascii_case(&agent.name));
            if taken {
                return Err(WorldError::DuplicateAgentName { name: agent.name });
            }
            state.agents.insert(agent_id.clone(), agent);
        }

        let handle = pipeline::spawn(Arc::downgrade(&self.inner), agent_id.clone());
        registry.pipelines.insert(agent_id.clone(), handle);

        info!(world_id = %self.inner.id, agent_id = %agent_id, "agent joined");
        Ok(())
    }

    /// Remove an agent. Its pipeline stops after the current cycle.
    pub fn remove_agent(&self, agent_id: &str) -> Result<Agent> {
        let mut registry = self.inner.lock_registry();
        let agent = self
            .inner
            .lock_state()
            .agents
            .shift_remove(agent_id)
            .ok_or_else(|| self.agent_not_found(agent_id))?;

        if let Some(handle) = registry.pipelines.remove(agent_id) {
            handle.leave();
        }

        info!(world_id = %self.inner.id, agent_id = %agent_id, "agent left");
        Ok(agent)
    }

    /// Copy of an agent.
    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.inner.lock_state().agents.get(agent_id).cloned()
    }

    /// Copies of all agents, in insertion order.
    pub fn agents(&self) -> Vec<Agent> {
        self.inner.lock_state().agents.values().cloned().collect()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.inner.lock_state().agents.keys().cloned().collect()
    }

    /// Copy of an agent's memory.
    pub fn memory(&self, agent_id: &str) -> Option<Vec<Message>> {
        self.inner
            .lock_state()
            .agents
            .get(agent_id)
            .map(|a| a.memory.clone())
    }

    pub fn clear_agent_memory(&self, agent_id: &str) -> Result<()> {
        self.with_agent(agent_id, |agent| agent.memory.clear())
    }

    pub fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        self.with_agent(agent_id, |agent| agent.status = status)
    }

    pub fn update_agent_config(&self, agent_id: &str, config: ModelConfig) -> Result<()> {
        self.with_agent(agent_id, |agent| agent.config = config)
    }

    fn with_agent(&self, agent_id: &str, f: impl FnOnce(&mut Agent)) -> Result<()> {
        let mut state = self.inner.lock_state();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| self.agent_not_found(agent_id))?;
        f(agent);
        Ok(())
    }

    fn agent_not_found(&self, agent_id: &str) -> WorldError {
        WorldError::AgentNotFound {
            world_id: self.inner.id.clone(),
            agent_id: agent_id.to_string(),
        }
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Inject a message. `sender` is `"human"`, `"system"` or an agent id.
    ///
    /// The message is queued for every agent before this returns; responses
    /// happen in the background.
    pub fn publish(&self, content: impl Into<String>, sender: &str) -> MessageId {
        let sender = Sender::classify(sender);
        self.inner
            .dispatch(WorldMessage::new(self.inner.id.clone(), content, sender.as_str()))
    }

    /// Observe every message published on this world.
    pub fn subscribe_messages<F>(&self, handler: F) -> Subscription
    where
        F: Fn(WorldMessage) + Send + Sync + 'static,
    {
        self.inner.bus.on_message(handler)
    }

    /// Observe stream events and notices, e.g. to forward them as SSE.
    pub fn subscribe_sse<F>(&self, handler: F) -> Subscription
    where
        F: Fn(WorldEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on_event(handler)
    }

    /// Wait until every published message has been fully processed by every
    /// agent, including the replies it triggered.
    pub async fn wait_idle(&self) {
        self.inner.activity.wait_idle().await
    }

    /// Deliveries not processed yet.
    pub fn pending(&self) -> usize {
        self.inner.activity.pending()
    }

    /// Stop every pipeline after its current cycle, and the autosave task.
    pub fn shutdown(&self) {
        let mut registry = self.inner.lock_registry();
        for (_, handle) in registry.pipelines.drain() {
            handle.leave();
        }
        drop(registry);

        if let Some(handle) = self.take_autosave() {
            handle.abort();
        }
        info!(world_id = %self.inner.id, "world shut down");
    }

    // =========================================================================
    // Chat state (used by the chat session manager)
    // =========================================================================

    /// Copy of every agent's memory, in agent order.
    pub(crate) fn memories(&self) -> IndexMap<AgentId, Vec<Message>> {
        self.inner
            .lock_state()
            .agents
            .iter()
            .map(|(id, agent)| (id.clone(), agent.memory.clone()))
            .collect()
    }

    /// Replace every agent's memory. Agents missing from `memories` start
    /// empty. Replies still in flight for the previous memory are dropped.
    pub(crate) fn replace_memories(&self, memories: &IndexMap<AgentId, Vec<Message>>) {
        let mut state = self.inner.lock_state();
        state.chat_epoch += 1;
        for (id, agent) in state.agents.iter_mut() {
            agent.memory = memories.get(id).cloned().unwrap_or_default();
        }
    }

    pub(crate) fn set_active_chat(&self, chat_id: Option<ChatId>) {
        self.inner.lock_state().active_chat_id = chat_id;
    }

    pub(crate) fn subscribe_cycles(&self) -> watch::Receiver<u64> {
        self.inner.cycles.subscribe()
    }

    pub(crate) fn set_autosave(&self, handle: JoinHandle<()>) {
        let previous = recover(self.inner.autosave.lock(), &self.inner.id, "autosave")
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn take_autosave(&self) -> Option<JoinHandle<()>> {
        recover(self.inner.autosave.lock(), &self.inner.id, "autosave").take()
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<WorldInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<WorldInner>) -> Self {
        Self { inner }
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("agents", &self.agent_ids())
            .finish()
    }
}

fn validate_turn_limit(turn_limit: u32) -> Result<()> {
    if turn_limit == 0 {
        return Err(WorldError::InvalidConfig(
            "turn limit must be at least 1".into(),
        ));
    }
    Ok(())
}
