//! # Replica Core
//!
//! Pure data model for the Replica synchronization core: entities, mutations,
//! patches and query descriptors.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over field maps.
//!
//! ## Key Types
//!
//! - [`Entity`] - The visible, best-known value of one record
//! - [`Snapshot`] - A remote-confirmed state of a record at a given [`Version`]
//! - [`Mutation`] - A queued local write (CREATE, UPDATE or DELETE)
//! - [`Query`] - Filter, ordering and pagination over one collection
//!
//! ## Projection
//!
//! The value a user sees is always `apply_patches(last_snapshot, pending_ops)`.
//! See the [`patch`] module.

pub mod canonical;
pub mod entity;
pub mod error;
pub mod mutation;
pub mod patch;
pub mod query;
pub mod types;
pub mod validation;

pub use canonical::{canonical_entity_bytes, canonical_snapshot_bytes};
pub use entity::{Entity, Origin, Snapshot};
pub use error::{CoreError, ValidationError};
pub use mutation::{FailureRecord, Mutation, MutationDraft, MutationKind, MutationOp, MutationState};
pub use patch::{apply_op, apply_patches, diff_fields, merge_patch};
pub use query::{compare_values, Direction, Filter, OrderBy, Query};
pub use types::{CollectionName, EntityId, EntityKey, Fields, SeqNo, UserId, Version};
pub use validation::validate_draft;

/// Get current time in milliseconds.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
