//! Error types for the Replica core.

use thiserror::Error;

use crate::types::EntityKey;

/// Core errors that can occur while encoding or decoding records.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("unknown mutation kind: {0}")]
    UnknownKind(u8),
}

/// A mutation was malformed and rejected before it reached the queue.
///
/// Validation errors are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("update of {0} carries an empty patch")]
    EmptyPatch(EntityKey),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid field name {field:?} on {key}")]
    InvalidField { key: EntityKey, field: String },

    #[error("entity {0} does not exist")]
    UnknownEntity(EntityKey),

    #[error("entity {0} already exists")]
    AlreadyExists(EntityKey),

    #[error("entity {0} has an unresolved conflict")]
    UnresolvedConflict(EntityKey),
}
