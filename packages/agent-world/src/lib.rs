//! Multi-Agent World Routing
//!
//! An in-process core for "worlds": shared rooms where a human, the system
//! and several LLM-backed agents exchange messages. Each world owns a
//! broadcast bus; each agent listens on it, decides whether to answer,
//! streams its reply back and remembers what it heard.
//!
//! # Routing Rules
//!
//! - Everyone hears everything (except their own messages)
//! - Leading `@mentions` address a message; an agent only answers when it is
//!   the first one named, or when a human/system message names nobody
//! - Agent-to-agent chains stop after a per-world turn limit until a human or
//!   the system speaks again
//! - Agents answering other agents address them automatically
//!
//! # Usage
//!
//! ```rust,ignore
//! use agent_world::{MemoryStorage, ModelConfig, WorldManager, WorldSettings};
//! use agent_world::testing::{Reply, ScriptedProvider};
//!
//! let provider = ScriptedProvider::new().reply("m-alice", Reply::Text("hello".into()));
//! let manager = WorldManager::new(
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(provider),
//!     WorldSettings::default(),
//! )?;
//!
//! let world = manager.create_world("Research Lab", Some(5)).await?;
//! manager.create_agent(&world, "Alice", ModelConfig::new("test", "m-alice")).await?;
//!
//! world.publish("@alice hi there", "human");
//! world.wait_idle().await;
//! ```
//!
//! # Modules
//!
//! - [`world`] - A running world: agents, bus, dispatch
//! - [`manager`] - Creating, loading and editing worlds and agents
//! - [`chat`] - Chat sessions and memory snapshots
//! - [`decision`] - Whether an agent answers a message
//! - [`pipeline`] - Per-agent processing and reply post-processing
//! - [`streaming`] - Streaming model output onto the bus
//! - [`types`] - Identifiers, senders and memory entries
//! - [`traits`] - Storage and LLM collaborator abstractions
//! - [`stores`] - Storage implementations (memory, files)
//! - [`testing`] - Scripted provider and bus recorder for tests

pub mod activity;
pub mod agent;
pub mod bus;
pub mod chat;
pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod manager;
pub mod mention;
pub mod pipeline;
pub mod stores;
pub mod streaming;
pub mod testing;
pub mod traits;
pub mod turn;
pub mod types;
pub mod world;

#[cfg(feature = "openai")]
pub mod ai;

// Re-export core types at crate root
pub use agent::{Agent, AgentRecord, AgentStatus, ModelConfig};
pub use types::{
    id_from_name, AgentId, ChatId, Message, MessageId, Role, Sender, WorldId, HUMAN_SENDER,
    SYSTEM_SENDER,
};
pub use error::{ProviderError, Result, StorageError, WorldError};
pub use events::{
    NoticeKind, StreamEvent, StreamKind, SystemNotice, WorldEvent, WorldMessage,
};
pub use traits::{
    llm::{ChatRole, LlmChunk, LlmMessage, LlmProvider, LlmStream, Usage},
    storage::{StorageResult, WorldStorage},
};

// Re-export runtime components
pub use bus::{EventBus, Subscription};
pub use chat::{ChatSessionManager, ChatSnapshot, ChatSummary};
pub use config::{Config, WorldSettings};
pub use decision::{decide, should_respond, Decision, SkipReason};
pub use manager::WorldManager;
pub use turn::TurnCounter;
pub use world::{World, WorldRecord};

// Re-export stores
pub use stores::{FileStorage, MemoryStorage};

#[cfg(feature = "openai")]
pub use ai::OpenAiProvider;

// Re-export testing utilities
pub use testing::{CountingStorage, EventRecorder, Reply, ScriptedProvider};
