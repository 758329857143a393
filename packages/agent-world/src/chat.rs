//! Chat sessions: named snapshots of a world's agent memory.
//!
//! Exactly one chat is active per world. Its snapshot is kept current by an
//! autosave task that runs after every completed processing cycle; writes
//! skip when nothing changed since the last save. Snapshot writes for one
//! world are serialized by the world's snapshot lock.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentStatus};
use crate::config::WorldSettings;
use crate::types::{AgentId, ChatId, Message, MessageId, Sender, WorldId};
use crate::error::{Result, WorldError};
use crate::events::{NoticeKind, SystemNotice};
use crate::traits::llm::LlmProvider;
use crate::traits::storage::WorldStorage;
use crate::world::World;

const TITLE_MAX_CHARS: usize = 60;

/// Persisted memory state of a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSnapshot {
    pub chat_id: ChatId,
    pub world_id: WorldId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Memory per agent, in agent order.
    #[serde(default)]
    pub memories: IndexMap<AgentId, Vec<Message>>,
    /// Distinct messages across all memories.
    #[serde(default)]
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSnapshot {
    /// Snapshot with no memory.
    pub fn empty(world_id: impl Into<WorldId>, chat_id: impl Into<ChatId>) -> Self {
        let now = Utc::now();
        Self {
            chat_id: chat_id.into(),
            world_id: world_id.into(),
            title: None,
            memories: IndexMap::new(),
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> ChatSummary {
        ChatSummary {
            chat_id: self.chat_id.clone(),
            world_id: self.world_id.clone(),
            title: self.title.clone(),
            message_count: self.message_count,
            updated_at: self.updated_at,
        }
    }
}

/// Listing entry for a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub world_id: WorldId,
    pub title: Option<String>,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Per-world bookkeeping behind the snapshot lock.
#[derive(Debug, Default)]
pub(crate) struct SnapshotState {
    last_saved: Option<Fingerprint>,
}

/// Cheap identity of what was last written.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    chat_id: Option<ChatId>,
    agents: Vec<(AgentId, usize, Option<MessageId>, u32, AgentStatus)>,
}

impl Fingerprint {
    fn of(chat_id: Option<&str>, agents: &[Agent]) -> Self {
        Self {
            chat_id: chat_id.map(str::to_string),
            agents: agents
                .iter()
                .map(|a| {
                    (
                        a.id.clone(),
                        a.memory.len(),
                        a.memory.last().map(|m| m.id),
                        a.llm_call_count,
                        a.status,
                    )
                })
                .collect(),
        }
    }

    fn current(world: &World) -> Self {
        Self::of(world.active_chat_id().as_deref(), &world.agents())
    }
}

/// Chat title: first line of the earliest human message, shortened.
pub fn derive_title(memories: &IndexMap<AgentId, Vec<Message>>) -> Option<String> {
    let first = memories
        .values()
        .flatten()
        .filter(|m| m.sender_kind() == Sender::Human)
        .min_by_key(|m| m.created_at)?;

    let line = first.content.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.chars().count() <= TITLE_MAX_CHARS {
        return Some(line.to_string());
    }
    let mut title: String = line.chars().take(TITLE_MAX_CHARS - 3).collect();
    title.push_str("...");
    Some(title)
}

fn count_messages(memories: &IndexMap<AgentId, Vec<Message>>) -> usize {
    memories
        .values()
        .flatten()
        .map(|m| m.id)
        .collect::<HashSet<_>>()
        .len()
}

fn generate_chat_id() -> ChatId {
    format!("chat-{}", Uuid::new_v4().simple())
}

/// Loads worlds and swaps their chats.
#[derive(Clone)]
pub struct ChatSessionManager {
    storage: Arc<dyn WorldStorage>,
    provider: Arc<dyn LlmProvider>,
    settings: WorldSettings,
}

impl ChatSessionManager {
    pub fn new(
        storage: Arc<dyn WorldStorage>,
        provider: Arc<dyn LlmProvider>,
        settings: WorldSettings,
    ) -> Self {
        Self {
            storage,
            provider,
            settings,
        }
    }

    pub fn storage(&self) -> &Arc<dyn WorldStorage> {
        &self.storage
    }

    /// Load a world with its agents and activate a chat.
    ///
    /// The recorded active chat is restored when it exists. Otherwise the most
    /// recently updated chat becomes active, or a fresh empty one is created.
    /// Starts the autosave task.
    pub async fn load_world(&self, world_id: &str) -> Result<World> {
        let record = self
            .storage
            .load_world(world_id)
            .await?
            .ok_or_else(|| WorldError::WorldNotFound {
                world_id: world_id.to_string(),
            })?;
        let recorded_chat = record.active_chat_id.clone();

        let world = World::from_record(record, self.settings.clone(), self.provider.clone())?;
        for agent in self.storage.list_agents(world_id).await? {
            world.add_agent(Agent::from_record(agent))?;
        }

        let mut restored = match recorded_chat.as_deref() {
            Some(chat_id) => self.storage.load_chat(world_id, chat_id).await?,
            None => None,
        };
        if restored.is_none() {
            if let Some(latest) = self.storage.list_chats(world_id).await?.first() {
                restored = self.storage.load_chat(world_id, &latest.chat_id).await?;
            }
        }
        let snapshot = match restored {
            Some(snapshot) => snapshot,
            None => {
                let snapshot = ChatSnapshot::empty(world_id, generate_chat_id());
                self.storage.save_chat(&snapshot).await?;
                snapshot
            }
        };

        {
            let mut snap = world.inner.snapshot.lock().await;
            world.replace_memories(&snapshot.memories);
            world.set_active_chat(Some(snapshot.chat_id.clone()));
            self.storage.save_world(&world.record()).await?;
            snap.last_saved = Some(Fingerprint::current(&world));
        }

        self.spawn_autosave(&world);
        info!(
            world_id = %world_id,
            chat_id = %snapshot.chat_id,
            agents = world.agents().len(),
            "world loaded"
        );
        Ok(world)
    }

    /// Save the current chat, then start an empty one and make it active.
    pub async fn new_chat(&self, world: &World) -> Result<ChatId> {
        let mut snap = world.inner.snapshot.lock().await;
        self.save_locked(world, &mut snap).await?;

        let existing: HashSet<ChatId> = self
            .storage
            .list_chats(world.id())
            .await?
            .into_iter()
            .map(|c| c.chat_id)
            .collect();
        let mut chat_id = generate_chat_id();
        while existing.contains(&chat_id) {
            chat_id = generate_chat_id();
        }

        self.storage
            .save_chat(&ChatSnapshot::empty(world.id(), chat_id.clone()))
            .await?;
        let mut record = world.record();
        record.active_chat_id = Some(chat_id.clone());
        self.storage.save_world(&record).await?;

        world.replace_memories(&IndexMap::new());
        world.set_active_chat(Some(chat_id.clone()));
        snap.last_saved = Some(Fingerprint::current(world));
        drop(snap);

        world.bus().publish_event(SystemNotice::new(
            world.id(),
            NoticeKind::ChatCreated,
            format!("Started chat {}", chat_id),
        ));
        info!(world_id = %world.id(), chat_id = %chat_id, "chat created");
        Ok(chat_id)
    }

    /// Save the current chat, then restore `chat_id` and make it active.
    pub async fn load_chat(&self, world: &World, chat_id: &str) -> Result<()> {
        let mut snap = world.inner.snapshot.lock().await;

        let target = self
            .storage
            .load_chat(world.id(), chat_id)
            .await?
            .filter(|c| c.world_id == world.id())
            .ok_or_else(|| WorldError::ChatNotFound {
                world_id: world.id().to_string(),
                chat_id: chat_id.to_string(),
            })?;

        self.save_locked(world, &mut snap).await?;
        self.activate(world, &target).await?;
        snap.last_saved = Some(Fingerprint::current(world));
        drop(snap);

        world.bus().publish_event(SystemNotice::new(
            world.id(),
            NoticeKind::ChatLoaded,
            format!("Loaded chat {}", chat_id),
        ));
        info!(world_id = %world.id(), chat_id = %chat_id, "chat loaded");
        Ok(())
    }

    /// Write every agent's memory to the active chat. No-op when nothing
    /// changed since the last save.
    pub async fn save_current_state(&self, world: &World) -> Result<()> {
        let mut snap = world.inner.snapshot.lock().await;
        self.save_locked(world, &mut snap).await
    }

    /// Chats of a world, most recently updated first.
    pub async fn list_chats(&self, world: &World) -> Result<Vec<ChatSummary>> {
        Ok(self.storage.list_chats(world.id()).await?)
    }

    /// Delete a chat. Deleting the active chat activates the most recent
    /// remaining chat, or a fresh one.
    pub async fn delete_chat(&self, world: &World, chat_id: &str) -> Result<()> {
        let mut snap = world.inner.snapshot.lock().await;

        if !self.storage.delete_chat(world.id(), chat_id).await? {
            return Err(WorldError::ChatNotFound {
                world_id: world.id().to_string(),
                chat_id: chat_id.to_string(),
            });
        }

        if world.active_chat_id().as_deref() == Some(chat_id) {
            let next = match self.storage.list_chats(world.id()).await?.first() {
                Some(latest) => self.storage.load_chat(world.id(), &latest.chat_id).await?,
                None => None,
            };
            let next = match next {
                Some(next) => next,
                None => {
                    let fresh = ChatSnapshot::empty(world.id(), generate_chat_id());
                    self.storage.save_chat(&fresh).await?;
                    fresh
                }
            };
            self.activate(world, &next).await?;
            snap.last_saved = Some(Fingerprint::current(world));
        }
        drop(snap);

        world.bus().publish_event(SystemNotice::new(
            world.id(),
            NoticeKind::ChatDeleted,
            format!("Deleted chat {}", chat_id),
        ));
        info!(world_id = %world.id(), chat_id = %chat_id, "chat deleted");
        Ok(())
    }

    /// Save the active chat after every completed processing cycle.
    ///
    /// Failures are logged; the conversation goes on.
    pub fn spawn_autosave(&self, world: &World) {
        let weak = world.downgrade();
        let mut cycles = world.subscribe_cycles();
        let manager = self.clone();

        let handle = tokio::spawn(async move {
            while cycles.changed().await.is_ok() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let world = World::from_inner(inner);
                if let Err(e) = manager.save_current_state(&world).await {
                    warn!(world_id = %world.id(), error = %e, "autosave failed");
                }
            }
        });
        world.set_autosave(handle);
    }

    async fn activate(&self, world: &World, snapshot: &ChatSnapshot) -> Result<()> {
        let mut record = world.record();
        record.active_chat_id = Some(snapshot.chat_id.clone());
        self.storage.save_world(&record).await?;

        world.replace_memories(&snapshot.memories);
        world.set_active_chat(Some(snapshot.chat_id.clone()));
        Ok(())
    }

    async fn save_locked(&self, world: &World, snap: &mut SnapshotState) -> Result<()> {
        let Some(chat_id) = world.active_chat_id() else {
            return Ok(());
        };
        let agents = world.agents();
        let fingerprint = Fingerprint::of(Some(&chat_id), &agents);
        if snap.last_saved.as_ref() == Some(&fingerprint) {
            debug!(world_id = %world.id(), chat_id = %chat_id, "chat unchanged, skipping save");
            return Ok(());
        }

        let previous = self.storage.load_chat(world.id(), &chat_id).await?;
        let memories: IndexMap<AgentId, Vec<Message>> = agents
            .iter()
            .map(|a| (a.id.clone(), a.memory.clone()))
            .collect();

        let snapshot = ChatSnapshot {
            chat_id: chat_id.clone(),
            world_id: world.id().to_string(),
            title: derive_title(&memories).or_else(|| previous.as_ref().and_then(|p| p.title.clone())),
            message_count: count_messages(&memories),
            memories,
            created_at: previous.map(|p| p.created_at).unwrap_or_else(Utc::now),
            updated_at: Utc::now(),
        };
        self.storage.save_chat(&snapshot).await?;

        for agent in &agents {
            self.storage.save_agent(world.id(), &agent.to_record()).await?;
        }

        snap.last_saved = Some(fingerprint);
        debug!(
            world_id = %world.id(),
            chat_id = %chat_id,
            message_count = snapshot.message_count,
            "chat saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::agent::ModelConfig;
    use crate::events::WorldMessage;
    use crate::stores::MemoryStorage;
    use crate::testing::{settle, CountingStorage, ScriptedProvider};

    fn human(content: &str) -> Message {
        Message::inbound(&WorldMessage::new("w1", content, "human"))
    }

    #[test]
    fn test_title_from_first_human_message() {
        let mut memories = IndexMap::new();
        let first = human("Plan the launch\nwith details");
        let second = human("Something later");
        memories.insert(
            "alice".to_string(),
            vec![
                first.clone(),
                Message::assistant(MessageId::new(), "ok", "alice"),
            ],
        );
        memories.insert("bob".to_string(), vec![first, second]);

        assert_eq!(derive_title(&memories).as_deref(), Some("Plan the launch"));
        assert_eq!(count_messages(&memories), 3);
    }

    #[test]
    fn test_long_title_shortened() {
        let mut memories = IndexMap::new();
        memories.insert("alice".to_string(), vec![human(&"x".repeat(100))]);
        let title = derive_title(&memories).unwrap();
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_no_title_without_human_messages() {
        let mut memories = IndexMap::new();
        memories.insert(
            "alice".to_string(),
            vec![Message::assistant(MessageId::new(), "hi", "alice")],
        );
        assert!(derive_title(&memories).is_none());
    }

    #[test]
    fn test_generated_chat_ids_are_distinct() {
        let a = generate_chat_id();
        let b = generate_chat_id();
        assert!(a.starts_with("chat-"));
        assert_ne!(a, b);
    }

    fn counted_world(storage: Arc<CountingStorage>) -> (World, ChatSessionManager) {
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new());
        let world = World::new("Ledger", WorldSettings::default(), provider.clone()).unwrap();
        world
            .add_agent(Agent::new("alice", ModelConfig::new("test", "m-alice")).unwrap())
            .unwrap();
        world.set_active_chat(Some("chat-1".to_string()));
        let manager = ChatSessionManager::new(storage, provider, WorldSettings::default());
        (world, manager)
    }

    #[tokio::test]
    async fn test_unchanged_state_is_not_rewritten() {
        let storage = Arc::new(CountingStorage::new(Arc::new(MemoryStorage::new())));
        let (world, manager) = counted_world(storage.clone());

        manager.save_current_state(&world).await.unwrap();
        assert_eq!(storage.chat_saves(), 1);

        manager.save_current_state(&world).await.unwrap();
        assert_eq!(storage.chat_saves(), 1);

        world.publish("@nobody a note", "human");
        settle(&world).await;
        manager.save_current_state(&world).await.unwrap();
        assert_eq!(storage.chat_saves(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_saves_write_one_at_a_time() {
        let storage = Arc::new(
            CountingStorage::new(Arc::new(MemoryStorage::new()))
                .with_write_delay(Duration::from_millis(20)),
        );
        let (world, manager) = counted_world(storage.clone());

        let saves = (0..5).map(|_| manager.save_current_state(&world));
        for result in futures::future::join_all(saves).await {
            result.unwrap();
        }

        assert_eq!(storage.max_concurrent_saves(), 1);
        assert_eq!(storage.chat_saves(), 1);
    }

    #[test]
    fn test_snapshot_json_defaults() {
        let json = r#"{
            "chat_id": "chat-1",
            "world_id": "w1",
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        }"#;
        let snapshot: ChatSnapshot = serde_json::from_str(json).unwrap();
        assert!(snapshot.memories.is_empty());
        assert_eq!(snapshot.summary().message_count, 0);
    }
}
