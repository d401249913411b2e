//! Error types for the sync module.

use replica_core::{EntityKey, SeqNo};
use thiserror::Error;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The mutation was malformed or not applicable. Never retried.
    #[error("validation error: {0}")]
    Validation(#[from] replica_core::ValidationError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] replica_store::StoreError),

    /// The remote version moved under a local mutation.
    #[error("conflict on {0}")]
    Conflict(EntityKey),

    /// The mutation exhausted its retry budget or was rejected permanently.
    #[error("mutation {seq} failed: {reason}")]
    Terminal { seq: SeqNo, reason: String },

    /// `resolve_conflict` was called for an entity without a conflict.
    #[error("no conflict on {0}")]
    NoConflict(EntityKey),

    /// No failure record with this sequence number.
    #[error("no failure record for mutation {0}")]
    NoFailure(SeqNo),

    /// The signed-in user changed before the operation settled.
    #[error("session changed")]
    SessionChanged,

    /// The engine task is no longer running.
    #[error("sync engine stopped")]
    EngineStopped,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
