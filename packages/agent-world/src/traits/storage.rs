//! Storage collaborator.
//!
//! Persistence is split by record kind but kept in one trait, since every
//! world needs all three:
//! - world records (name, turn limit, active chat)
//! - agent records (config, call count, status; no memory)
//! - chat snapshots (per-agent memory)
//!
//! Absence is `Ok(None)` / `Ok(false)`, never an error.

use async_trait::async_trait;

use crate::agent::AgentRecord;
use crate::chat::{ChatSnapshot, ChatSummary};
use crate::error::StorageError;
use crate::world::WorldRecord;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait WorldStorage: Send + Sync {
    // =========================================================================
    // Worlds
    // =========================================================================

    async fn load_world(&self, world_id: &str) -> StorageResult<Option<WorldRecord>>;

    async fn save_world(&self, world: &WorldRecord) -> StorageResult<()>;

    /// All stored worlds, in no particular order.
    async fn list_worlds(&self) -> StorageResult<Vec<WorldRecord>>;

    // =========================================================================
    // Agents
    // =========================================================================

    async fn load_agent(&self, world_id: &str, agent_id: &str)
        -> StorageResult<Option<AgentRecord>>;

    async fn save_agent(&self, world_id: &str, agent: &AgentRecord) -> StorageResult<()>;

    /// Agents of a world, ordered by creation time.
    async fn list_agents(&self, world_id: &str) -> StorageResult<Vec<AgentRecord>>;

    /// Returns false when the agent did not exist.
    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> StorageResult<bool>;

    // =========================================================================
    // Chats
    // =========================================================================

    async fn load_chat(&self, world_id: &str, chat_id: &str)
        -> StorageResult<Option<ChatSnapshot>>;

    async fn save_chat(&self, snapshot: &ChatSnapshot) -> StorageResult<()>;

    /// Chat summaries, most recently updated first.
    async fn list_chats(&self, world_id: &str) -> StorageResult<Vec<ChatSummary>>;

    /// Returns false when the chat did not exist.
    async fn delete_chat(&self, world_id: &str, chat_id: &str) -> StorageResult<bool>;

    /// True when a chat exists. Loads it by default.
    async fn chat_exists(&self, world_id: &str, chat_id: &str) -> StorageResult<bool> {
        Ok(self.load_chat(world_id, chat_id).await?.is_some())
    }
}
