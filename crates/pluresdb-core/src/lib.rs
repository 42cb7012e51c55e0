//! Core data structures, CRDT logic, and the record store that power
//! PluresDB.
//!
//! This crate holds everything a single peer needs short of the network:
//! the replicated record model and its merge operator, the persistent
//! store, the in-memory vector index with its default text embedder, and
//! the rule engine hook. The mesh replicator in `pluresdb-sync` drives
//! the store through [`Store::apply_remote`] and the [`StoreEvent`]
//! stream; everything else is local.

pub mod embedding;
pub mod error;
pub mod index;
pub mod record;
pub mod rules;
pub mod store;

pub use embedding::{EmbedText, HashEmbedder, EMBEDDING_DIM};
pub use error::{StoreError, StoreResult};
pub use index::{cosine_similarity, VectorIndex};
pub use record::{NodeId, NodeRecord, PeerId, TimestampMs, VectorClock};
pub use rules::{Rule, RuleContext};
pub use store::{
    Store, StoreEvent, StoreOptions, SubscriptionHandle, VectorSearchResult,
};
