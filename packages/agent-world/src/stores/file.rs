//! JSON file storage.
//!
//! Layout under the data directory:
//!
//! ```text
//! worlds/<world_id>/world.json
//! worlds/<world_id>/agents/<agent_id>.json
//! worlds/<world_id>/chats/<chat_id>.json
//! ```
//!
//! Writes go to a temporary file that is renamed over the target, so a crash
//! never leaves a half-written record behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, warn};

use crate::agent::AgentRecord;
use crate::chat::{ChatSnapshot, ChatSummary};
use crate::error::StorageError;
use crate::traits::storage::{StorageResult, WorldStorage};
use crate::world::WorldRecord;

/// File-backed storage rooted at a data directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn worlds_dir(&self) -> PathBuf {
        self.root.join("worlds")
    }

    fn world_dir(&self, world_id: &str) -> StorageResult<PathBuf> {
        Ok(self.worlds_dir().join(safe_segment(world_id)?))
    }

    fn world_path(&self, world_id: &str) -> StorageResult<PathBuf> {
        Ok(self.world_dir(world_id)?.join("world.json"))
    }

    fn agents_dir(&self, world_id: &str) -> StorageResult<PathBuf> {
        Ok(self.world_dir(world_id)?.join("agents"))
    }

    fn agent_path(&self, world_id: &str, agent_id: &str) -> StorageResult<PathBuf> {
        Ok(self
            .agents_dir(world_id)?
            .join(format!("{}.json", safe_segment(agent_id)?)))
    }

    fn chats_dir(&self, world_id: &str) -> StorageResult<PathBuf> {
        Ok(self.world_dir(world_id)?.join("chats"))
    }

    fn chat_path(&self, world_id: &str, chat_id: &str) -> StorageResult<PathBuf> {
        Ok(self
            .chats_dir(world_id)?
            .join(format!("{}.json", safe_segment(chat_id)?)))
    }
}

/// Reject ids that would escape their directory.
fn safe_segment(id: &str) -> StorageResult<&str> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(StorageError::Backend(anyhow::anyhow!(
            "invalid storage id: {:?}",
            id
        )));
    }
    Ok(id)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StorageError::Backend(
                anyhow::Error::new(e).context(format!("failed to read {}", path.display())),
            ))
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StorageError::Corrupt {
            key: path.display().to_string(),
            reason: e.to_string(),
        })
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let json = serde_json::to_vec_pretty(value).context("failed to serialize record")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to move {} into place", path.display()))?;

    debug!(path = %path.display(), bytes = json.len(), "record written");
    Ok(())
}

async fn remove_file(path: &Path) -> StorageResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::Backend(
            anyhow::Error::new(e).context(format!("failed to delete {}", path.display())),
        )),
    }
}

/// `*.json` files in a directory. A missing directory is empty.
async fn json_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[async_trait]
impl WorldStorage for FileStorage {
    async fn load_world(&self, world_id: &str) -> StorageResult<Option<WorldRecord>> {
        read_json(&self.world_path(world_id)?).await
    }

    async fn save_world(&self, world: &WorldRecord) -> StorageResult<()> {
        write_json(&self.world_path(&world.id)?, world).await
    }

    async fn list_worlds(&self) -> StorageResult<Vec<WorldRecord>> {
        let mut entries = match fs::read_dir(self.worlds_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut worlds = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match read_json::<WorldRecord>(&entry.path().join("world.json")).await {
                Ok(Some(world)) => worlds.push(world),
                Ok(None) => {}
                Err(StorageError::Corrupt { key, reason }) => {
                    warn!(key = %key, reason = %reason, "skipping corrupt world record");
                }
                Err(e) => return Err(e),
            }
        }
        worlds.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(worlds)
    }

    async fn load_agent(
        &self,
        world_id: &str,
        agent_id: &str,
    ) -> StorageResult<Option<AgentRecord>> {
        read_json(&self.agent_path(world_id, agent_id)?).await
    }

    async fn save_agent(&self, world_id: &str, agent: &AgentRecord) -> StorageResult<()> {
        write_json(&self.agent_path(world_id, &agent.id)?, agent).await
    }

    async fn list_agents(&self, world_id: &str) -> StorageResult<Vec<AgentRecord>> {
        let mut agents = Vec::new();
        for path in json_files(&self.agents_dir(world_id)?).await? {
            if let Some(agent) = read_json::<AgentRecord>(&path).await? {
                agents.push(agent);
            }
        }
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(agents)
    }

    async fn delete_agent(&self, world_id: &str, agent_id: &str) -> StorageResult<bool> {
        remove_file(&self.agent_path(world_id, agent_id)?).await
    }

    async fn load_chat(
        &self,
        world_id: &str,
        chat_id: &str,
    ) -> StorageResult<Option<ChatSnapshot>> {
        read_json(&self.chat_path(world_id, chat_id)?).await
    }

    async fn save_chat(&self, snapshot: &ChatSnapshot) -> StorageResult<()> {
        write_json(&self.chat_path(&snapshot.world_id, &snapshot.chat_id)?, snapshot).await
    }

    async fn list_chats(&self, world_id: &str) -> StorageResult<Vec<ChatSummary>> {
        let mut chats = Vec::new();
        for path in json_files(&self.chats_dir(world_id)?).await? {
            match read_json::<ChatSnapshot>(&path).await {
                Ok(Some(chat)) => chats.push(chat.summary()),
                Ok(None) => {}
                Err(StorageError::Corrupt { key, reason }) => {
                    warn!(key = %key, reason = %reason, "skipping corrupt chat snapshot");
                }
                Err(e) => return Err(e),
            }
        }
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.chat_id.cmp(&b.chat_id)));
        Ok(chats)
    }

    async fn delete_chat(&self, world_id: &str, chat_id: &str) -> StorageResult<bool> {
        remove_file(&self.chat_path(world_id, chat_id)?).await
    }

    async fn chat_exists(&self, world_id: &str, chat_id: &str) -> StorageResult<bool> {
        Ok(fs::try_exists(self.chat_path(world_id, chat_id)?).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::agent::{Agent, ModelConfig};
    use crate::types::Message;
    use crate::types::MessageId;

    fn world(id: &str) -> WorldRecord {
        WorldRecord {
            id: id.into(),
            name: "Test World".into(),
            description: Some("scratch".into()),
            turn_limit: 3,
            active_chat_id: Some("chat-1".into()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_world_and_agent_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStorage::new(dir.path());

        store.save_world(&world("w1")).await.unwrap();
        let alice = Agent::new("alice", ModelConfig::default()).unwrap().to_record();
        store.save_agent("w1", &alice).await.unwrap();

        assert!(dir.path().join("worlds/w1/world.json").exists());
        assert!(dir.path().join("worlds/w1/agents/alice.json").exists());

        let loaded = store.load_world("w1").await.unwrap().unwrap();
        assert_eq!(loaded.active_chat_id.as_deref(), Some("chat-1"));
        assert_eq!(store.load_agent("w1", "alice").await.unwrap(), Some(alice));
        assert_eq!(store.list_worlds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_records_are_none() {
        let dir = TempDir::new().unwrap();
        let store = FileStorage::new(dir.path());

        assert!(store.load_world("nope").await.unwrap().is_none());
        assert!(store.load_chat("nope", "chat-1").await.unwrap().is_none());
        assert!(store.list_worlds().await.unwrap().is_empty());
        assert!(store.list_chats("nope").await.unwrap().is_empty());
        assert!(!store.delete_chat("nope", "chat-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_chat_round_trip_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileStorage::new(dir.path());

        let mut chat = ChatSnapshot::empty("w1", "chat-1");
        chat.memories.insert(
            "alice".into(),
            vec![Message::assistant(MessageId::new(), "hi", "alice")],
        );
        chat.message_count = 1;
        store.save_chat(&chat).await.unwrap();

        assert!(store.chat_exists("w1", "chat-1").await.unwrap());
        let loaded = store.load_chat("w1", "chat-1").await.unwrap().unwrap();
        assert_eq!(loaded, chat);
        assert_eq!(store.list_chats("w1").await.unwrap()[0].message_count, 1);

        assert!(store.delete_chat("w1", "chat-1").await.unwrap());
        assert!(!store.chat_exists("w1", "chat-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_chat_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = FileStorage::new(dir.path());
        let chats = dir.path().join("worlds/w1/chats");
        std::fs::create_dir_all(&chats).unwrap();
        std::fs::write(chats.join("chat-bad.json"), b"{ not json").unwrap();

        let err = store.load_chat("w1", "chat-bad").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));

        // Listing skips it.
        assert!(store.list_chats("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileStorage::new(dir.path());
        assert!(store.load_chat("w1", "../../etc/passwd").await.is_err());
        assert!(store.load_world("a/b").await.is_err());
    }
}
