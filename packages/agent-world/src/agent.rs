//! Agents: model-backed participants with private memory and a turn budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{id_from_name, AgentId, Message, RESERVED_SENDERS};
use crate::error::{Result, WorldError};

/// Model settings handed to the LLM collaborator. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider name (e.g. "openai").
    pub provider: String,

    /// Model id (e.g. "gpt-4o-mini").
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl ModelConfig {
    /// Create a config for the given provider and model.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the completion token cap.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Whether an agent takes part in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    /// Still records messages, never responds.
    Inactive,
    /// The last model call failed. Cleared by the next successful call.
    Error,
}

/// A participant in a world.
///
/// `llm_call_count` is only changed by [`crate::turn::TurnCounter`].
/// `memory` is append-only apart from explicit clears and chat swaps.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub config: ModelConfig,
    pub memory: Vec<Message>,
    pub llm_call_count: u32,
    pub last_call_at: Option<DateTime<Utc>>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    /// A turn-limit notice was already published for the current chain.
    pub(crate) limit_notice_sent: bool,
}

impl Agent {
    /// Create an agent with empty memory and a zero call count.
    ///
    /// The id is derived from `name` once and never changes afterwards.
    pub fn new(name: impl Into<String>, config: ModelConfig) -> Result<Self> {
        let name = name.into();
        let id = id_from_name(&name);
        if id.is_empty() {
            return Err(WorldError::InvalidConfig(format!(
                "agent name {:?} has no usable characters",
                name
            )));
        }
        if RESERVED_SENDERS.contains(&id.as_str()) {
            return Err(WorldError::InvalidConfig(format!(
                "agent name {:?} is reserved",
                name
            )));
        }

        Ok(Self {
            id,
            name: name.trim().to_string(),
            config,
            memory: Vec::new(),
            llm_call_count: 0,
            last_call_at: None,
            status: AgentStatus::Active,
            created_at: Utc::now(),
            limit_notice_sent: false,
        })
    }

    /// Rebuild an agent from its persisted record. Memory comes from the
    /// active chat snapshot, not from the record.
    pub fn from_record(record: AgentRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            config: record.config,
            memory: Vec::new(),
            llm_call_count: record.llm_call_count,
            last_call_at: record.last_call_at,
            status: record.status,
            created_at: record.created_at,
            limit_notice_sent: false,
        }
    }

    /// Persistable view of the agent (without memory).
    pub fn to_record(&self) -> AgentRecord {
        AgentRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            config: self.config.clone(),
            llm_call_count: self.llm_call_count,
            last_call_at: self.last_call_at,
            status: self.status,
            created_at: self.created_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != AgentStatus::Inactive
    }
}

/// Agent as stored by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub config: ModelConfig,
    #[serde(default)]
    pub llm_call_count: u32,
    #[serde(default)]
    pub last_call_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_agent_starts_empty() {
        let agent = Agent::new("Alice Smith", ModelConfig::default()).unwrap();
        assert_eq!(agent.id, "alice-smith");
        assert_eq!(agent.name, "Alice Smith");
        assert!(agent.memory.is_empty());
        assert_eq!(agent.llm_call_count, 0);
        assert_eq!(agent.status, AgentStatus::Active);
    }

    #[test]
    fn test_reserved_and_empty_names_rejected() {
        assert!(matches!(
            Agent::new("Human", ModelConfig::default()),
            Err(WorldError::InvalidConfig(_))
        ));
        assert!(matches!(
            Agent::new("???", ModelConfig::default()),
            Err(WorldError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_record_round_trip_drops_memory() {
        let mut agent = Agent::new("bob", ModelConfig::new("openai", "gpt-4o")).unwrap();
        agent.llm_call_count = 2;
        agent.memory.push(Message::assistant(
            crate::types::MessageId::new(),
            "hi",
            "bob",
        ));

        let restored = Agent::from_record(agent.to_record());
        assert_eq!(restored.id, "bob");
        assert_eq!(restored.llm_call_count, 2);
        assert_eq!(restored.config.model, "gpt-4o");
        assert!(restored.memory.is_empty());
    }

    #[test]
    fn test_record_json_defaults() {
        let json = r#"{
            "id": "bob",
            "name": "Bob",
            "config": {"provider": "openai", "model": "gpt-4o"},
            "created_at": "2025-01-01T00:00:00Z"
        }"#;
        let record: AgentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.llm_call_count, 0);
        assert_eq!(record.status, AgentStatus::Active);
        assert!(record.config.system_prompt.is_none());
    }
}
