//! PluresDB — P2P graph database, local-first and offline-first.
//!
//! This crate provides a unified API that re-exports the core PluresDB
//! functionality and wires a store to its mesh replicator.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pluresdb::{open_memory, StoreOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (store, mesh) = open_memory().await?;
//!
//! store.put("greeting", serde_json::json!({"text": "hello"})).await?;
//! mesh.serve("0.0.0.0:34569".parse()?).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crate Organization
//!
//! - **pluresdb-core**: record model, CRDT merge, store, vector index,
//!   rule engine
//! - **pluresdb-storage**: persistence backends (in-memory and sled)
//! - **pluresdb-sync**: mesh replication over WebSocket links
//!
//! This crate (`pluresdb`) re-exports the most commonly used types from
//! these crates for convenience; depend on the individual crates directly
//! if you prefer.

pub use pluresdb_core::{
    EmbedText, HashEmbedder, NodeId, NodeRecord, PeerId, Rule, RuleContext, Store, StoreError,
    StoreEvent, StoreOptions, StoreResult, SubscriptionHandle, TimestampMs, VectorClock,
    VectorSearchResult, EMBEDDING_DIM,
};

pub use pluresdb_storage::{MemoryStorage, SledStorage, StorageEngine, StorageError, StoredNode};

pub use pluresdb_sync::{LinkRole, MeshMessage, MeshReplicator, MeshServer};

/// Opens an in-memory database with a freshly minted peer id, wired to a
/// mesh replicator.
pub async fn open_memory() -> StoreResult<(Store, MeshReplicator)> {
    open(StoreOptions::in_memory()).await
}

/// Opens a sled-backed database at `path`, wired to a mesh replicator.
pub async fn open_persistent(
    path: impl Into<std::path::PathBuf>,
) -> StoreResult<(Store, MeshReplicator)> {
    open(StoreOptions::with_path(path)).await
}

/// Opens a database from explicit options, wired to a mesh replicator.
pub async fn open(options: StoreOptions) -> StoreResult<(Store, MeshReplicator)> {
    let store = Store::open(options).await?;
    let mesh = MeshReplicator::new(store.clone());
    Ok((store, mesh))
}
