//! Persistence seams and the reference stores.
//!
//! The link core only needs two things persisted: node records ([`NodeStore`]) and the
//! delivery state of messages we sent ([`MessageStore`]). [`JsonNodeStore`] keeps the node
//! database in a single JSON snapshot written atomically (temp file, rename, directory fsync)
//! under an advisory `fs2` lock; the in-memory stores back tests and the mock radio.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self as sfs, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::nodes::NodeRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<NodeRecord>, StoreError>;
    async fn upsert(&self, node: &NodeRecord) -> Result<(), StoreError>;
    async fn remove(&self, num: u32) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    Unknown,
    Queued,
    /// Handed to the radio, no ack yet.
    Enroute,
    /// Acked by a relay.
    Delivered,
    /// Acked by the destination.
    Received,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text { text: String },
    Reaction { emoji: String, reply_id: u32 },
    Other { portnum: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub packet_id: u32,
    /// Originated on this device.
    pub from_local: bool,
    pub to: u32,
    pub channel: u32,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub relays: u32,
    pub relay_node: Option<u32>,
    /// Reason code of the last routing nak, if any.
    #[serde(default)]
    pub routing_error: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl StoredMessage {
    pub fn outgoing(packet_id: u32, to: u32, channel: u32, kind: MessageKind) -> Self {
        let now = Utc::now();
        Self {
            packet_id,
            from_local: true,
            to,
            channel,
            kind,
            status: MessageStatus::Queued,
            retry_count: 0,
            relays: 0,
            relay_node: None,
            routing_error: None,
            created_at: now,
            last_attempt: Some(now),
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get(&self, packet_id: u32) -> Result<Option<StoredMessage>, StoreError>;
    async fn save(&self, msg: &StoredMessage) -> Result<(), StoreError>;
    /// Store `msg` under its (new) packet id, removing the entry for `old_id`.
    async fn replace(&self, old_id: u32, msg: &StoredMessage) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<HashMap<u32, StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<StoredMessage> {
        let mut all: Vec<StoredMessage> = self.messages.lock().await.values().cloned().collect();
        all.sort_by_key(|m| m.created_at);
        all
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn get(&self, packet_id: u32) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self.messages.lock().await.get(&packet_id).cloned())
    }

    async fn save(&self, msg: &StoredMessage) -> Result<(), StoreError> {
        self.messages
            .lock()
            .await
            .insert(msg.packet_id, msg.clone());
        Ok(())
    }

    async fn replace(&self, old_id: u32, msg: &StoredMessage) -> Result<(), StoreError> {
        let mut messages = self.messages.lock().await;
        messages.remove(&old_id);
        messages.insert(msg.packet_id, msg.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: Mutex<BTreeMap<u32, NodeRecord>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn load_all(&self) -> Result<Vec<NodeRecord>, StoreError> {
        Ok(self.nodes.lock().await.values().cloned().collect())
    }

    async fn upsert(&self, node: &NodeRecord) -> Result<(), StoreError> {
        self.nodes.lock().await.insert(node.num, node.clone());
        Ok(())
    }

    async fn remove(&self, num: u32) -> Result<(), StoreError> {
        self.nodes.lock().await.remove(&num);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.nodes.lock().await.clear();
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeSnapshot {
    saved_at: DateTime<Utc>,
    nodes: Vec<NodeRecord>,
}

/// Node database persisted as one JSON document.
pub struct JsonNodeStore {
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<u32, NodeRecord>>>,
}

impl JsonNodeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// `nodes.json` inside `data_dir`.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join("nodes.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_cache<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<u32, NodeRecord>) -> R,
    ) -> Result<R, StoreError> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            let path = self.path.clone();
            let loaded = tokio::task::spawn_blocking(move || read_snapshot(&path))
                .await
                .map_err(|e| StoreError::Task(e.to_string()))??;
            *guard = Some(loaded.into_iter().map(|n| (n.num, n)).collect());
        }
        let cache = guard.get_or_insert_with(BTreeMap::new);
        let result = f(cache);
        Ok(result)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let guard = self.cache.lock().await;
        let snapshot = NodeSnapshot {
            saved_at: Utc::now(),
            nodes: guard
                .as_ref()
                .map(|c| c.values().cloned().collect())
                .unwrap_or_default(),
        };
        let path = self.path.clone();
        // Hold the cache lock until the file is replaced so writes land in order.
        let result = tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;
        drop(guard);
        result
    }
}

fn lock_file_for(path: &Path) -> Result<File, StoreError> {
    let lock_path = path.with_extension("lock");
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            sfs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

fn read_snapshot(path: &Path) -> Result<Vec<NodeRecord>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let lock = lock_file_for(path)?;
    FileExt::lock_shared(&lock)?;
    let content = sfs::read_to_string(path);
    let _ = FileExt::unlock(&lock);
    let content = content?;
    // Guard against accidental leading NULs from previous partial writes
    let cleaned = content.trim_start_matches('\0');
    if cleaned.trim().is_empty() {
        return Ok(Vec::new());
    }
    let snapshot: NodeSnapshot = serde_json::from_str(cleaned)?;
    debug!(
        "read {} nodes from {} (saved {})",
        snapshot.nodes.len(),
        path.display(),
        snapshot.saved_at
    );
    Ok(snapshot.nodes)
}

fn write_snapshot(path: &Path, snapshot: &NodeSnapshot) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(snapshot)?;
    let lock = lock_file_for(path)?;
    FileExt::lock_exclusive(&lock)?;
    let result = write_atomic(path, content.as_bytes());
    let _ = FileExt::unlock(&lock);
    result
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    sfs::create_dir_all(dir)?;
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("nodes.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut tmp) => {
                tmp.write_all(content)?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    };

    sfs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

#[async_trait]
impl NodeStore for JsonNodeStore {
    async fn load_all(&self) -> Result<Vec<NodeRecord>, StoreError> {
        self.with_cache(|c| c.values().cloned().collect()).await
    }

    async fn upsert(&self, node: &NodeRecord) -> Result<(), StoreError> {
        let node = node.clone();
        self.with_cache(move |c| {
            c.insert(node.num, node);
        })
        .await?;
        self.flush().await
    }

    async fn remove(&self, num: u32) -> Result<(), StoreError> {
        let removed = self.with_cache(|c| c.remove(&num).is_some()).await?;
        if removed {
            self.flush().await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.with_cache(|c| c.clear()).await?;
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_store_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonNodeStore::in_dir(dir.path());
        let mut node = NodeRecord::placeholder(0x42);
        node.is_favorite = true;
        store.upsert(&node).await.expect("upsert");
        store
            .upsert(&NodeRecord::placeholder(0x43))
            .await
            .expect("upsert");
        store.remove(0x43).await.expect("remove");

        let reopened = JsonNodeStore::in_dir(dir.path());
        let nodes = reopened.load_all().await.expect("load");
        assert_eq!(nodes, vec![node]);
    }

    #[tokio::test]
    async fn missing_or_nul_padded_file_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonNodeStore::in_dir(dir.path());
        assert!(store.load_all().await.expect("empty").is_empty());

        let path = dir.path().join("padded.json");
        let snapshot = NodeSnapshot {
            saved_at: Utc::now(),
            nodes: vec![NodeRecord::placeholder(1)],
        };
        let mut content = vec![0u8; 3];
        content.extend(serde_json::to_vec(&snapshot).expect("encode"));
        std::fs::write(&path, content).expect("write");
        let nodes = JsonNodeStore::new(&path).load_all().await.expect("load");
        assert_eq!(nodes.len(), 1);
    }

    #[tokio::test]
    async fn memory_message_store_rekeys() {
        let store = MemoryMessageStore::new();
        let mut msg = StoredMessage::outgoing(
            1,
            2,
            0,
            MessageKind::Text {
                text: "hi".into(),
            },
        );
        store.save(&msg).await.expect("save");
        msg.packet_id = 9;
        store.replace(1, &msg).await.expect("replace");
        assert!(store.get(1).await.expect("get").is_none());
        assert_eq!(store.get(9).await.expect("get"), Some(msg));
    }
}
