//! Error types for Replica.

use replica_core::ValidationError;
use replica_store::StoreError;
use replica_sync::SyncError;
use thiserror::Error;

use crate::media::MediaError;

/// Errors that can occur during Replica operations.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// The mutation was malformed or not applicable.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(SyncError),

    /// Media upload or deletion failed.
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    /// No user is signed in.
    #[error("no user signed in")]
    SignedOut,
}

impl From<SyncError> for ReplicaError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Validation(e) => ReplicaError::Validation(e),
            SyncError::Store(e) => ReplicaError::Store(e),
            other => ReplicaError::Sync(other),
        }
    }
}

/// Result type for Replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;
