//! Everything a world bus carries.
//!
//! Two kinds of traffic travel on separate channels:
//!
//! - [`WorldMessage`] - conversational messages every agent pipeline records
//! - [`WorldEvent`] - stream fragments of in-flight responses and system
//!   notices, for observers (CLI, SSE transport)
//!
//! Every value carries its `world_id`; the bus refuses values from another
//! world.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, MessageId, Sender, WorldId};
use crate::traits::llm::Usage;

/// A message published to a world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldMessage {
    pub world_id: WorldId,
    pub id: MessageId,
    /// Position in the world's publish order. Assigned on publish.
    #[serde(default)]
    pub seq: u64,
    pub content: String,
    /// Raw sender: an agent id, `"human"` or `"system"`.
    pub sender: String,
    pub created_at: DateTime<Utc>,
}

impl WorldMessage {
    pub fn new(
        world_id: impl Into<WorldId>,
        content: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            world_id: world_id.into(),
            id: MessageId::new(),
            seq: 0,
            content: content.into(),
            sender: sender.into(),
            created_at: Utc::now(),
        }
    }

    /// Use a known id (an agent reply reuses its stream correlation id).
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn sender_kind(&self) -> Sender {
        Sender::classify(&self.sender)
    }
}

/// One fragment of an agent's in-flight response.
///
/// `message_id` correlates the fragments of one response and equals the id of
/// the message the agent finally publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub world_id: WorldId,
    pub agent_id: AgentId,
    pub message_id: MessageId,
    #[serde(flatten)]
    pub kind: StreamKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamKind {
    Start,
    Chunk { content: String },
    End { content: String, usage: Usage },
    Error { error: String },
}

impl StreamKind {
    /// `End` or `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamKind::End { .. } | StreamKind::Error { .. })
    }
}

/// Out-of-band notice from the world about its chats.
///
/// Turn-limit notices are regular messages from the throttled agent, so
/// message observers and other agents' memories see them too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemNotice {
    pub world_id: WorldId,
    pub kind: NoticeKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl SystemNotice {
    pub fn new(world_id: impl Into<WorldId>, kind: NoticeKind, content: impl Into<String>) -> Self {
        Self {
            world_id: world_id.into(),
            kind,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    ChatCreated,
    ChatLoaded,
    ChatDeleted,
}

/// Observer-facing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum WorldEvent {
    Stream(StreamEvent),
    System(SystemNotice),
}

impl WorldEvent {
    pub fn world_id(&self) -> &str {
        match self {
            WorldEvent::Stream(e) => &e.world_id,
            WorldEvent::System(n) => &n.world_id,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamEvent> {
        match self {
            WorldEvent::Stream(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_notice(&self) -> Option<&SystemNotice> {
        match self {
            WorldEvent::System(n) => Some(n),
            _ => None,
        }
    }
}

impl From<StreamEvent> for WorldEvent {
    fn from(event: StreamEvent) -> Self {
        WorldEvent::Stream(event)
    }
}

impl From<SystemNotice> for WorldEvent {
    fn from(notice: SystemNotice) -> Self {
        WorldEvent::System(notice)
    }
}
