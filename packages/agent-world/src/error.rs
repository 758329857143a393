//! Typed errors for the routing core.
//!
//! Uses `thiserror` for library errors (not `anyhow`). `anyhow` only appears
//! as the payload of storage backend failures and in the binary.
//!
//! # The Error Boundary Rule
//!
//! Model provider failures during an in-flight response never cross the
//! pipeline boundary as `Err`: they are published as an `error` stream event
//! and logged. Everything a caller asks for synchronously (load a world, load
//! a chat, add an agent) returns a [`WorldError`].

use thiserror::Error;

/// Result type for routing core operations.
pub type Result<T> = std::result::Result<T, WorldError>;

/// Errors surfaced to callers of the routing core.
#[derive(Debug, Error)]
pub enum WorldError {
    #[error("world not found: {world_id}")]
    WorldNotFound { world_id: String },

    #[error("agent not found: {agent_id} (world {world_id})")]
    AgentNotFound { world_id: String, agent_id: String },

    #[error("chat not found: {chat_id} (world {world_id})")]
    ChatNotFound { world_id: String, chat_id: String },

    #[error("agent name already in use: {name}")]
    DuplicateAgentName { name: String },

    /// Storage collaborator failed.
    #[error("storage error: {0}")]
    StorageIo(#[source] anyhow::Error),

    /// Model provider failed. Non-fatal to the world.
    #[error("model provider error: {0}")]
    ModelProvider(#[from] ProviderError),

    /// Persisted chat data could not be decoded.
    #[error("corrupt snapshot {key}: {reason}")]
    SnapshotCorrupt { key: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl WorldError {
    /// True for the lookup failures (world, agent, chat).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WorldError::WorldNotFound { .. }
                | WorldError::AgentNotFound { .. }
                | WorldError::ChatNotFound { .. }
        )
    }
}

impl From<StorageError> for WorldError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Backend(e) => WorldError::StorageIo(e),
            StorageError::Corrupt { key, reason } => WorldError::SnapshotCorrupt { key, reason },
        }
    }
}

/// Errors from the storage collaborator.
///
/// Absence is not an error: lookups return `Ok(None)`.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Storage backend failed (IO, poisoned lock, serialization).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),

    /// A stored record exists but cannot be decoded.
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Backend(err.into())
    }
}

/// Errors from the LLM collaborator.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Configuration error (missing API key, unknown model)
    #[error("configuration error: {0}")]
    Config(String),

    /// Network error (connection failed, timeout)
    #[error("network error: {0}")]
    Network(String),

    /// API error (non-2xx response, rate limit, invalid request)
    #[error("API error: {0}")]
    Api(String),

    /// Parse error (invalid JSON, unexpected response format)
    #[error("parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_maps_to_world_error() {
        let err: WorldError = StorageError::Corrupt {
            key: "w1/chat-1".into(),
            reason: "expected value".into(),
        }
        .into();
        assert!(matches!(err, WorldError::SnapshotCorrupt { .. }));

        let err: WorldError = StorageError::Backend(anyhow::anyhow!("disk full")).into();
        assert!(matches!(err, WorldError::StorageIo(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_is_not_found() {
        let err = WorldError::ChatNotFound {
            world_id: "w1".into(),
            chat_id: "nope".into(),
        };
        assert!(err.is_not_found());
        assert!(!WorldError::InvalidConfig("x".into()).is_not_found());
    }

    #[test]
    fn test_provider_error_converts() {
        let err: WorldError = ProviderError::Network("timeout".into()).into();
        assert!(err.to_string().contains("timeout"));
    }
}
