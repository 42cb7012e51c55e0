//! Error taxonomy of the store.

use pluresdb_storage::StorageError;
use thiserror::Error;

use crate::record::NodeId;

/// Errors surfaced by store operations.
///
/// Subscriber and rule failures are deliberately absent: they are logged
/// and isolated, never propagated. Dropped mesh sends are likewise only a
/// logged condition in the replicator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An operation ran before the backend was opened or after close.
    #[error("store is not open")]
    NotOpen,
    /// A persistence or worker operation failed; retriable.
    #[error("i/o failure: {0}")]
    Io(String),
    /// The id or record violates structural invariants.
    #[error("malformed input: {0}")]
    MalformedInput(String),
    /// No record under the requested id (or version).
    #[error("node not found: {0}")]
    NotFound(NodeId),
    /// The operation was waiting when the store closed underneath it.
    #[error("store closed while operation was in flight")]
    Closed,
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotOpen => StoreError::NotOpen,
            other => StoreError::Io(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
