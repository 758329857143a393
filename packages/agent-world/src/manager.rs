//! World and agent management on top of storage.
//!
//! Every management change is persisted right away: world records on
//! creation, agent records on create/update/remove, and the active chat when
//! memory is cleared.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::agent::{Agent, AgentStatus, ModelConfig};
use crate::chat::ChatSessionManager;
use crate::config::WorldSettings;
use crate::types::WorldId;
use crate::error::{Result, WorldError};
use crate::traits::llm::LlmProvider;
use crate::traits::storage::WorldStorage;
use crate::world::{World, WorldRecord};

pub struct WorldManager {
    storage: Arc<dyn WorldStorage>,
    settings: WorldSettings,
    chats: ChatSessionManager,
    loaded: Mutex<HashMap<WorldId, World>>,
}

impl WorldManager {
    pub fn new(
        storage: Arc<dyn WorldStorage>,
        provider: Arc<dyn LlmProvider>,
        settings: WorldSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            chats: ChatSessionManager::new(storage.clone(), provider, settings.clone()),
            storage,
            settings,
            loaded: Mutex::new(HashMap::new()),
        })
    }

    pub fn chats(&self) -> &ChatSessionManager {
        &self.chats
    }

    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    fn loaded(&self) -> std::sync::MutexGuard<'_, HashMap<WorldId, World>> {
        match self.loaded.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("world cache mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    // =========================================================================
    // Worlds
    // =========================================================================

    /// Create and load a new world. Fails when the derived id is taken.
    pub async fn create_world(&self, name: &str, turn_limit: Option<u32>) -> Result<World> {
        let record = WorldRecord::new(name, turn_limit.unwrap_or(self.settings.default_turn_limit));
        if record.id.is_empty() {
            return Err(WorldError::InvalidConfig(format!(
                "world name {:?} has no usable characters",
                name
            )));
        }
        if record.turn_limit == 0 {
            return Err(WorldError::InvalidConfig(
                "turn limit must be at least 1".into(),
            ));
        }
        if self.storage.load_world(&record.id).await?.is_some() {
            return Err(WorldError::InvalidConfig(format!(
                "world already exists: {}",
                record.id
            )));
        }

        self.storage.save_world(&record).await?;
        info!(world_id = %record.id, "world created");
        self.load_world(&record.id).await
    }

    pub async fn list_worlds(&self) -> Result<Vec<WorldRecord>> {
        Ok(self.storage.list_worlds().await?)
    }

    /// Load a world, or return it if it is already running.
    pub async fn load_world(&self, world_id: &str) -> Result<World> {
        let running = self.loaded().get(world_id).cloned();
        if let Some(world) = running {
            return Ok(world);
        }

        let world = self.chats.load_world(world_id).await?;

        // Another caller may have loaded it meanwhile; keep the first one.
        let mut loaded = self.loaded();
        if let Some(existing) = loaded.get(world_id) {
            world.shutdown();
            return Ok(existing.clone());
        }
        loaded.insert(world_id.to_string(), world.clone());
        Ok(world)
    }

    /// Save the active chat and stop a running world.
    pub async fn unload_world(&self, world_id: &str) -> Result<()> {
        let world = self
            .loaded()
            .remove(world_id)
            .ok_or_else(|| WorldError::WorldNotFound {
                world_id: world_id.to_string(),
            })?;
        world.shutdown();
        self.chats.save_current_state(&world).await
    }

    /// Update a world's turn limit and persist it.
    pub async fn set_turn_limit(&self, world: &World, turn_limit: u32) -> Result<()> {
        world.set_turn_limit(turn_limit)?;
        self.storage.save_world(&world.record()).await?;
        Ok(())
    }

    // =========================================================================
    // Agents
    // =========================================================================

    /// Create an agent, add it to the world and persist it.
    pub async fn create_agent(&self, world: &World, name: &str, config: ModelConfig) -> Result<Agent> {
        let agent = Agent::new(name, config)?;
        world.add_agent(agent.clone())?;
        self.storage
            .save_agent(world.id(), &agent.to_record())
            .await?;
        info!(world_id = %world.id(), agent_id = %agent.id, "agent created");
        Ok(agent)
    }

    pub async fn remove_agent(&self, world: &World, agent_id: &str) -> Result<()> {
        world.remove_agent(agent_id)?;
        self.storage.delete_agent(world.id(), agent_id).await?;
        self.chats.save_current_state(world).await
    }

    pub async fn clear_agent_memory(&self, world: &World, agent_id: &str) -> Result<()> {
        world.clear_agent_memory(agent_id)?;
        self.chats.save_current_state(world).await
    }

    pub async fn set_agent_status(
        &self,
        world: &World,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<()> {
        world.set_agent_status(agent_id, status)?;
        self.persist_agent(world, agent_id).await
    }

    pub async fn update_agent_config(
        &self,
        world: &World,
        agent_id: &str,
        config: ModelConfig,
    ) -> Result<()> {
        world.update_agent_config(agent_id, config)?;
        self.persist_agent(world, agent_id).await
    }

    async fn persist_agent(&self, world: &World, agent_id: &str) -> Result<()> {
        let agent = world.agent(agent_id).ok_or_else(|| WorldError::AgentNotFound {
            world_id: world.id().to_string(),
            agent_id: agent_id.to_string(),
        })?;
        self.storage
            .save_agent(world.id(), &agent.to_record())
            .await?;
        Ok(())
    }
}
