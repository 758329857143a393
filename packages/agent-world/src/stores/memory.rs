//! In-memory storage implementation for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::agent::AgentRecord;
use crate::chat::{ChatSnapshot, ChatSummary};
use crate::types::{AgentId, ChatId, WorldId};
use crate::error::StorageError;
use crate::traits::storage::{StorageResult, WorldStorage};
use crate::world::WorldRecord;

/// In-memory storage for worlds, agents and chats.
///
/// Data is lost on restart.
pub struct MemoryStorage {
    worlds: RwLock<HashMap<WorldId, WorldRecord>>,
    agents: RwLock<HashMap<(WorldId, AgentId), AgentRecord>>,
    chats: RwLock<HashMap<(WorldId, ChatId), ChatSnapshot>>,
    fail_writes: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            worlds: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            chats: RwLock::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored chats across all worlds.
    pub fn chat_count(&self) -> usize {
        self.chats.read().map(|c| c.len()).unwrap_or(0)
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(anyhow::anyhow!(
                "memory storage is failing writes"
            )));
        }
        Ok(())
    }
}

fn read<T>(lock: &RwLock<T>) -> StorageResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| StorageError::Backend(anyhow::anyhow!("memory storage lock poisoned")))
}

fn write<T>(lock: &RwLock<T>) -> StorageResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| StorageError::Backend(anyhow::anyhow!("memory storage lock poisoned")))
}

#[async_trait]
impl WorldStorage for MemoryStorage {
    async fn load_world(&self, world_id: &str) -> StorageResult<Option<WorldRecord>> {
        Ok(read(&self.worlds)?.get(world_id).cloned())
    }

    async fn save_world(&self, world: &WorldRecord) -> StorageResult<()> {
        self.check_writable()?;
        write(&self.worlds)?.insert(world.id.clone(), world.clone());
        Ok(())
    }

    async fn list_worlds(&self) -> StorageResult<Vec<WorldRecord>> {
        let mut worlds: Vec<WorldRecord> = read(&self.worlds)?.values().cloned().collect();
        worlds.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(worlds)
    }

    async fn load_agent(
        &self,
        world_id: &str,
        agent_id: &str,
    ) -> StorageResult<Option<AgentRecord>> {
        let key = (world_id.to_string(), agent_id.to_string());
        Ok(read(&self.agents)?.get(&key).cloned())
    }

    async fn save_agent(&self, world_id: &str, agent: &AgentRecord) -> StorageResult<()> {
        self.check_writable()?;
        write(&self.agents)?.insert((world_id.to_string(), agent.id.clone()), agent.clone());
        Ok(())
    }

    async fn list_agents(&self, world_id: &str) -> StorageResult<Vec<AgentRecord>> {
        let mut agents: Vec<AgentRecord> = read(&self.agents)?
            .iter()
            .filter(|((w, _), _)| w == world_id)
            .map(|(_, a)| a.clone())
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(agents)
    }

    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> StorageResult<bool> {
        self.check_writable()?;
        let key = (world_id.to_string(), agent_id.to_string());
        Ok(write(&self.agents)?.remove(&key).is_some())
    }

    async fn load_chat(
        &self,
        world_id: &str,
        chat_id: &str,
    ) -> StorageResult<Option<ChatSnapshot>> {
        let key = (world_id.to_string(), chat_id.to_string());
        Ok(read(&self.chats)?.get(&key).cloned())
    }

    async fn save_chat(&self, snapshot: &ChatSnapshot) -> StorageResult<()> {
        self.check_writable()?;
        write(&self.chats)?.insert(
            (snapshot.world_id.clone(), snapshot.chat_id.clone()),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn list_chats(&self, world_id: &str) -> StorageResult<Vec<ChatSummary>> {
        let mut chats: Vec<ChatSummary> = read(&self.chats)?
            .iter()
            .filter(|((w, _), _)| w == world_id)
            .map(|(_, c)| c.summary())
            .collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.chat_id.cmp(&b.chat_id)));
        Ok(chats)
    }

    async fn delete_chat(&self, world_id: &str, chat_id: &str) -> StorageResult<bool> {
        self.check_writable()?;
        let key = (world_id.to_string(), chat_id.to_string());
        Ok(write(&self.chats)?.remove(&key).is_some())
    }
}
