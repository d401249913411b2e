//! Store trait: the abstract interface for durable local state.
//!
//! This trait keeps the synchronization core storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use replica_core::{
    CollectionName, EntityKey, FailureRecord, Mutation, Origin, SeqNo, Snapshot, UserId,
};

use crate::error::Result;

/// A persisted entity cache record.
///
/// Only the remote snapshot (the shadow value) is stored. The visible value is
/// recomputed from it and the pending mutations on load.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntity {
    pub snapshot: Snapshot,
    /// Origin of the visible value when the record was written.
    pub origin: Origin,
}

/// The Store trait: async interface for durable local state.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// Every record is namespaced by [`UserId`]: signing in as another user never
/// replays or exposes the previous user's records.
///
/// # Design Notes
///
/// - **Durable queue**: Mutations are written before the enqueue is acknowledged.
/// - **Idempotent removal**: Removing a missing record is not an error.
/// - **Ordered replay**: `load_mutations` returns records in sequence order.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Mutation Queue
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a newly enqueued mutation.
    async fn append_mutation(&self, user: &UserId, mutation: &Mutation) -> Result<()>;

    /// Overwrite a queued mutation (attempt counter, state, rebased version).
    async fn update_mutation(&self, user: &UserId, mutation: &Mutation) -> Result<()>;

    /// Remove a queued mutation.
    ///
    /// Returns `false` if it was already gone.
    async fn remove_mutation(
        &self,
        user: &UserId,
        collection: &CollectionName,
        seq: SeqNo,
    ) -> Result<bool>;

    /// Load all queued mutations for a user, ordered by sequence number.
    async fn load_mutations(&self, user: &UserId) -> Result<Vec<Mutation>>;

    /// Highest sequence number ever recorded on this device (any user).
    ///
    /// Includes failure records so that sequence numbers are never reused.
    async fn max_seq(&self) -> Result<Option<SeqNo>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Entity Cache
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace an entity record.
    async fn put_entity(&self, user: &UserId, entity: &PersistedEntity) -> Result<()>;

    /// Remove an entity record.
    async fn remove_entity(&self, user: &UserId, key: &EntityKey) -> Result<()>;

    /// Load all entity records for a user.
    async fn load_entities(&self, user: &UserId) -> Result<Vec<PersistedEntity>>;

    /// Drop every entity record for a user.
    async fn clear_entities(&self, user: &UserId) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Failure Records
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a terminal failure.
    async fn record_failure(&self, user: &UserId, record: &FailureRecord) -> Result<()>;

    /// List failure records for a user, ordered by sequence number.
    async fn list_failures(&self, user: &UserId) -> Result<Vec<FailureRecord>>;

    /// Remove and return a failure record.
    async fn take_failure(&self, user: &UserId, seq: SeqNo) -> Result<Option<FailureRecord>>;
}

/// Blanket implementation so that shared handles can be used as stores.
#[async_trait]
impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    async fn append_mutation(&self, user: &UserId, mutation: &Mutation) -> Result<()> {
        (**self).append_mutation(user, mutation).await
    }

    async fn update_mutation(&self, user: &UserId, mutation: &Mutation) -> Result<()> {
        (**self).update_mutation(user, mutation).await
    }

    async fn remove_mutation(
        &self,
        user: &UserId,
        collection: &CollectionName,
        seq: SeqNo,
    ) -> Result<bool> {
        (**self).remove_mutation(user, collection, seq).await
    }

    async fn load_mutations(&self, user: &UserId) -> Result<Vec<Mutation>> {
        (**self).load_mutations(user).await
    }

    async fn max_seq(&self) -> Result<Option<SeqNo>> {
        (**self).max_seq().await
    }

    async fn put_entity(&self, user: &UserId, entity: &PersistedEntity) -> Result<()> {
        (**self).put_entity(user, entity).await
    }

    async fn remove_entity(&self, user: &UserId, key: &EntityKey) -> Result<()> {
        (**self).remove_entity(user, key).await
    }

    async fn load_entities(&self, user: &UserId) -> Result<Vec<PersistedEntity>> {
        (**self).load_entities(user).await
    }

    async fn clear_entities(&self, user: &UserId) -> Result<()> {
        (**self).clear_entities(user).await
    }

    async fn record_failure(&self, user: &UserId, record: &FailureRecord) -> Result<()> {
        (**self).record_failure(user, record).await
    }

    async fn list_failures(&self, user: &UserId) -> Result<Vec<FailureRecord>> {
        (**self).list_failures(user).await
    }

    async fn take_failure(&self, user: &UserId, seq: SeqNo) -> Result<Option<FailureRecord>> {
        (**self).take_failure(user, seq).await
    }
}
