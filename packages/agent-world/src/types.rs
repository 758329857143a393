//! Identifiers, messages and sender classification.
//!
//! # Senders
//!
//! Every message on a world bus carries a raw sender string. It is classified
//! exactly once into a [`Sender`] and the rest of the crate pattern-matches on
//! that value:
//!
//! - [`Sender::Human`] - `"human"` / `"user"` (and an empty sender)
//! - [`Sender::System`] - `"system"` / `"world"`
//! - [`Sender::Agent`] - anything else, normalized to a lowercase agent id

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// World identifier (kebab-case, derived from the world name).
pub type WorldId = String;

/// Agent identifier (kebab-case, derived once from the agent name).
pub type AgentId = String;

/// Chat identifier (unique per world).
pub type ChatId = String;

/// Canonical sender string for human input.
pub const HUMAN_SENDER: &str = "human";

/// Canonical sender string for system input.
pub const SYSTEM_SENDER: &str = "system";

/// Sender names that can never be used as agent ids.
pub const RESERVED_SENDERS: &[&str] = &["human", "user", "system", "world"];

/// Unique id of a message.
///
/// Also used as the correlation id of the stream events that produce an
/// agent's response, so observers can reassemble partial output per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new random message id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who authored a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sender {
    /// A person typing into the world.
    Human,
    /// Another agent, by id.
    Agent(AgentId),
    /// The world itself or an operator tool.
    System,
}

impl Sender {
    /// Classify a raw sender string.
    ///
    /// A blank sender has no author to reply to and is treated as the
    /// world itself, so it never counts as a human.
    pub fn classify(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "human" | "user" => Sender::Human,
            "" | "system" | "world" => Sender::System,
            _ => Sender::Agent(normalized),
        }
    }

    /// Human or system input. These reset turn budgets and count as broadcasts.
    pub fn is_external(&self) -> bool {
        matches!(self, Sender::Human | Sender::System)
    }

    /// The agent id when the sender is an agent.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Sender::Agent(id) => Some(id),
            _ => None,
        }
    }

    /// Canonical sender string.
    pub fn as_str(&self) -> &str {
        match self {
            Sender::Human => HUMAN_SENDER,
            Sender::System => SYSTEM_SENDER,
            Sender::Agent(id) => id,
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a memory entry from the owning agent's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Something another participant said.
    User,
    /// Something this agent said.
    Assistant,
}

/// An entry in an agent's memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub sender: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Memory entry for a message another participant published.
    pub fn inbound(message: &crate::events::WorldMessage) -> Self {
        Self {
            id: message.id,
            role: Role::User,
            content: message.content.clone(),
            sender: message.sender.clone(),
            created_at: message.created_at,
        }
    }

    /// Memory entry for this agent's own reply.
    pub fn assistant(id: MessageId, content: impl Into<String>, agent_id: &str) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: content.into(),
            sender: agent_id.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Classified sender.
    pub fn sender_kind(&self) -> Sender {
        Sender::classify(&self.sender)
    }
}

/// Derive a stable kebab-case id from a display name.
///
/// `"Alice Smith"` becomes `"alice-smith"`; runs of anything that is not
/// alphanumeric, `-` or `_` collapse to a single `-`.
pub fn id_from_name(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    let mut pending_dash = false;

    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            if pending_dash && !id.is_empty() {
                id.push('-');
            }
            pending_dash = false;
            id.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    id
}
