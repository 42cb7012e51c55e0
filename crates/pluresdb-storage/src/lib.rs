//! Persistence backends for PluresDB.
//!
//! The store above this layer deals in merged CRDT records; down here a
//! record is just an id plus an opaque JSON payload. Two backends are
//! provided: a non-durable in-memory map for tests and ephemeral
//! deployments, and a sled-backed implementation for durable single-process
//! use. Both keep a bounded per-id history of superseded versions so the
//! store can offer `history`/`restore` without a separate log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::IVec;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// How many superseded versions each backend keeps per id.
pub const HISTORY_DEPTH: usize = 64;

/// A persisted record: an id and the JSON payload the store gave us.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredNode {
    pub id: String,
    pub payload: serde_json::Value,
}

/// Errors produced by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend was used before `open` or after `close`.
    #[error("storage is not open")]
    NotOpen,
    /// A read or write against the underlying medium failed; retriable.
    #[error("storage i/o failure: {0}")]
    Io(String),
    /// A persisted value could not be decoded.
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupt(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Keyed record storage consumed by the store.
///
/// Single-key writes are atomic with respect to concurrent readers; nothing
/// here spans keys. `node_history` returns superseded versions newest first
/// and includes the current version as its head.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn get_node(&self, id: &str) -> StorageResult<Option<StoredNode>>;
    async fn set_node(&self, node: StoredNode) -> StorageResult<()>;
    async fn delete_node(&self, id: &str) -> StorageResult<()>;
    async fn list_nodes(&self) -> StorageResult<Vec<StoredNode>>;
    async fn node_history(&self, id: &str) -> StorageResult<Vec<StoredNode>>;
    async fn close(&self) -> StorageResult<()>;
}

/// Opens a backend at `path`; `None` or an empty path yields the in-memory
/// backend, anything else a sled database at that location.
pub fn open(path: Option<PathBuf>) -> StorageResult<Arc<dyn StorageEngine>> {
    match path {
        Some(p) if !p.as_os_str().is_empty() => Ok(Arc::new(SledStorage::open(p)?)),
        _ => Ok(Arc::new(MemoryStorage::default())),
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryInner {
    nodes: HashMap<String, StoredNode>,
    history: HashMap<String, Vec<StoredNode>>,
}

/// A non-persistent backend useful for tests and in-memory deployments.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    inner: Arc<RwLock<MemoryInner>>,
    closed: Arc<AtomicBool>,
}

impl MemoryStorage {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::NotOpen);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for MemoryStorage {
    async fn get_node(&self, id: &str) -> StorageResult<Option<StoredNode>> {
        self.ensure_open()?;
        Ok(self.inner.read().await.nodes.get(id).cloned())
    }

    async fn set_node(&self, node: StoredNode) -> StorageResult<()> {
        self.ensure_open()?;
        let mut inner = self.inner.write().await;
        let versions = inner.history.entry(node.id.clone()).or_default();
        versions.push(node.clone());
        if versions.len() > HISTORY_DEPTH {
            let excess = versions.len() - HISTORY_DEPTH;
            versions.drain(..excess);
        }
        inner.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> StorageResult<()> {
        self.ensure_open()?;
        let mut inner = self.inner.write().await;
        inner.nodes.remove(id);
        inner.history.remove(id);
        Ok(())
    }

    async fn list_nodes(&self) -> StorageResult<Vec<StoredNode>> {
        self.ensure_open()?;
        Ok(self.inner.read().await.nodes.values().cloned().collect())
    }

    async fn node_history(&self, id: &str) -> StorageResult<Vec<StoredNode>> {
        self.ensure_open()?;
        let inner = self.inner.read().await;
        let mut versions = inner.history.get(id).cloned().unwrap_or_default();
        versions.reverse();
        Ok(versions)
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sled backend
// ---------------------------------------------------------------------------

const NODES_TREE: &str = "nodes";
const HISTORY_TREE: &str = "history";

/// Durable storage based on the sled embedded database.
///
/// Current records live in the `nodes` tree keyed by id. Each write also
/// appends to the `history` tree under `id \0 seq` (sled's monotonic id
/// generator supplies `seq`), pruned to [`HISTORY_DEPTH`] entries per id.
/// Sled gives atomic single-key replacement, so a crash mid-write leaves
/// either the old or the new record, never a torn one.
#[derive(Debug, Clone)]
pub struct SledStorage {
    db: sled::Db,
    nodes: sled::Tree,
    history: sled::Tree,
    closed: Arc<AtomicBool>,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        info!(path = %path.as_ref().display(), "opening sled storage");
        let db = sled::open(path)?;
        let nodes = db.open_tree(NODES_TREE)?;
        let history = db.open_tree(HISTORY_TREE)?;
        Ok(Self {
            db,
            nodes,
            history,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::NotOpen);
        }
        Ok(())
    }

    fn serialize(node: &StoredNode) -> StorageResult<Vec<u8>> {
        Ok(serde_json::to_vec(node)?)
    }

    fn deserialize(bytes: IVec) -> StorageResult<StoredNode> {
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn history_key(id: &str, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(id.len() + 9);
        key.extend_from_slice(id.as_bytes());
        key.push(0);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn history_prefix(id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(id.len() + 1);
        prefix.extend_from_slice(id.as_bytes());
        prefix.push(0);
        prefix
    }

    fn append_history(&self, node: &StoredNode, bytes: &[u8]) -> StorageResult<()> {
        let seq = self.db.generate_id()?;
        self.history
            .insert(Self::history_key(&node.id, seq), bytes)?;

        // Prune oldest entries beyond the retention depth.
        let keys: Vec<IVec> = self
            .history
            .scan_prefix(Self::history_prefix(&node.id))
            .keys()
            .collect::<Result<_, _>>()?;
        if keys.len() > HISTORY_DEPTH {
            for key in &keys[..keys.len() - HISTORY_DEPTH] {
                self.history.remove(key)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for SledStorage {
    async fn get_node(&self, id: &str) -> StorageResult<Option<StoredNode>> {
        self.ensure_open()?;
        match self.nodes.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_node(&self, node: StoredNode) -> StorageResult<()> {
        self.ensure_open()?;
        let bytes = Self::serialize(&node)?;
        self.nodes.insert(node.id.as_bytes(), bytes.clone())?;
        self.append_history(&node, &bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> StorageResult<()> {
        self.ensure_open()?;
        self.nodes.remove(id.as_bytes())?;
        let keys: Vec<IVec> = self
            .history
            .scan_prefix(Self::history_prefix(id))
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.history.remove(key)?;
        }
        self.db.flush_async().await?;
        Ok(())
    }

    async fn list_nodes(&self) -> StorageResult<Vec<StoredNode>> {
        self.ensure_open()?;
        let mut out = Vec::new();
        for entry in self.nodes.iter() {
            let (_, value) = entry?;
            out.push(Self::deserialize(value)?);
        }
        Ok(out)
    }

    async fn node_history(&self, id: &str) -> StorageResult<Vec<StoredNode>> {
        self.ensure_open()?;
        let mut out = Vec::new();
        for entry in self.history.scan_prefix(Self::history_prefix(id)) {
            let (_, value) = entry?;
            out.push(Self::deserialize(value)?);
        }
        out.reverse();
        Ok(out)
    }

    async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("closing sled storage");
        self.db.flush_async().await?;
        Ok(())
    }
}
