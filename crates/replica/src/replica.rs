//! The Replica: unified API exposed to the UI layer.
//!
//! A `Replica` is one signed-in user's view of their collections. Writes
//! are applied optimistically and synced in the background; reads and
//! subscriptions always see the merged local projection.

use std::sync::Arc;

use bytes::Bytes;
use replica_core::{
    CollectionName, Entity, EntityKey, FailureRecord, Fields, MutationDraft, Query, SeqNo, UserId,
};
use replica_store::Store;
use replica_sync::{
    ChangeBatch, ConflictEvent, ProjectionDigest, RemoteSource, SubscriptionId, SyncConfig,
    SyncEngine, SyncHandle, SyncStatus,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::error::Result;
use crate::media::MediaStore;

/// Configuration for a Replica.
#[derive(Debug, Clone, Default)]
pub struct ReplicaConfig {
    /// Sync configuration.
    pub sync: SyncConfig,
    /// Collections kept in sync from the start. Subscribing to a query
    /// watches its collection as well.
    pub collections: Vec<CollectionName>,
}

impl ReplicaConfig {
    /// Watch `collection` from the start.
    pub fn watch(mut self, collection: impl Into<CollectionName>) -> Self {
        self.collections.push(collection.into());
        self
    }
}

/// The main Replica struct.
///
/// Provides a unified API for:
/// - Creating, updating and deleting entities
/// - Reading and querying the local projection
/// - Subscribing to change batches
/// - Resolving conflicts and recovering failed writes
/// - Attaching media
pub struct Replica<S: Store + 'static, R: RemoteSource> {
    handle: SyncHandle,
    store: Arc<S>,
    remote: Arc<R>,
    config: ReplicaConfig,
}

impl<S: Store + 'static, R: RemoteSource> Replica<S, R> {
    /// Load `user`'s state from `store` and start syncing with `remote`.
    pub async fn open(
        user: UserId,
        store: Arc<S>,
        remote: Arc<R>,
        config: ReplicaConfig,
    ) -> Result<Self> {
        let handle =
            SyncEngine::spawn(user.clone(), store.clone(), remote.clone(), config.sync.clone())
                .await?;
        for collection in &config.collections {
            handle.watch(collection.clone())?;
        }
        info!(%user, collections = config.collections.len(), "replica opened");

        Ok(Self {
            handle,
            store,
            remote,
            config,
        })
    }

    /// Get the store reference.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the remote source reference.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// The underlying sync handle.
    pub fn handle(&self) -> &SyncHandle {
        &self.handle
    }

    /// The signed-in user.
    pub fn user(&self) -> UserId {
        self.handle.status().user
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Write Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create an entity with a generated id. It is visible immediately.
    pub async fn create(
        &self,
        collection: impl Into<CollectionName>,
        fields: Fields,
    ) -> Result<EntityKey> {
        let draft = MutationDraft::create(collection, fields);
        let key = draft.key.clone();
        self.handle.enqueue(draft).await?;
        Ok(key)
    }

    /// Create an entity with a caller-chosen id.
    pub async fn create_with_id(&self, key: EntityKey, fields: Fields) -> Result<SeqNo> {
        Ok(self
            .handle
            .enqueue(MutationDraft::create_with_id(key, fields))
            .await?)
    }

    /// Patch an entity. A `null` value removes the field.
    pub async fn update(&self, key: EntityKey, patch: Fields) -> Result<SeqNo> {
        Ok(self.handle.enqueue(MutationDraft::update(key, patch)).await?)
    }

    pub async fn delete(&self, key: EntityKey) -> Result<SeqNo> {
        Ok(self.handle.enqueue(MutationDraft::delete(key)).await?)
    }

    /// Wait until a write is committed remotely.
    pub async fn confirm(&self, seq: SeqNo) -> Result<()> {
        Ok(self.handle.confirm(seq).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conflicts & Failures
    // ─────────────────────────────────────────────────────────────────────────

    /// Settle a conflict with the value the user chose. `None` deletes.
    pub async fn resolve_conflict(
        &self,
        key: EntityKey,
        chosen: Option<Fields>,
    ) -> Result<Option<SeqNo>> {
        Ok(self.handle.resolve_conflict(key, chosen).await?)
    }

    pub fn conflicts(&self) -> Vec<ConflictEvent> {
        self.handle.conflicts()
    }

    /// Re-enqueue a failed write. Returns its new sequence number.
    pub async fn retry_failure(&self, seq: SeqNo) -> Result<SeqNo> {
        Ok(self.handle.retry_failure(seq).await?)
    }

    pub async fn dismiss_failure(&self, seq: SeqNo) -> Result<()> {
        Ok(self.handle.dismiss_failure(seq).await?)
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.handle.failures()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Query Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get(&self, key: &EntityKey) -> Option<Entity> {
        self.handle.get(key)
    }

    pub fn query(&self, query: &Query) -> Vec<Entity> {
        self.handle.query(query)
    }

    /// Observe a query. The first batch holds the current window.
    pub fn subscribe(
        &self,
        query: Query,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<ChangeBatch>)> {
        Ok(self.handle.subscribe(query)?)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handle.unsubscribe(id)
    }

    /// Keep a collection in sync without observing it.
    pub fn watch(&self, collection: impl Into<CollectionName>) -> Result<()> {
        Ok(self.handle.watch(collection.into())?)
    }

    /// Digest of the visible entities of a collection.
    pub fn digest(&self, collection: &CollectionName) -> ProjectionDigest {
        self.handle.digest(collection)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn status(&self) -> SyncStatus {
        self.handle.status()
    }

    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.handle.status_receiver()
    }

    /// Wait until the writes restored from storage have settled.
    pub async fn wait_caught_up(&self) -> Result<()> {
        Ok(self.handle.wait_caught_up().await?)
    }

    /// Wait until no write is queued or in flight.
    pub async fn wait_idle(&self) -> Result<()> {
        self.handle
            .wait_for_status(|s| s.pending == 0 && s.in_flight == 0)
            .await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Media
    // ─────────────────────────────────────────────────────────────────────────

    /// Upload `bytes` and store the returned URL in `field` of `key`.
    ///
    /// If the update is refused the upload is deleted again.
    pub async fn attach_media<M: MediaStore + ?Sized>(
        &self,
        media: &M,
        key: EntityKey,
        field: &str,
        path: &str,
        bytes: Bytes,
    ) -> Result<String> {
        let url = media.upload(path, bytes).await?;
        let patch: Fields = [(field.to_string(), serde_json::Value::String(url.clone()))]
            .into_iter()
            .collect();
        if let Err(e) = self.handle.enqueue(MutationDraft::update(key, patch)).await {
            if let Err(cleanup) = media.delete(path).await {
                warn!(path, error = %cleanup, "failed to delete orphaned upload");
            }
            return Err(e.into());
        }
        Ok(url)
    }

    /// Clear `field` of `key` and delete the object at `path`.
    pub async fn detach_media<M: MediaStore + ?Sized>(
        &self,
        media: &M,
        key: EntityKey,
        field: &str,
        path: &str,
    ) -> Result<SeqNo> {
        let patch: Fields = [(field.to_string(), serde_json::Value::Null)]
            .into_iter()
            .collect();
        let seq = self.handle.enqueue(MutationDraft::update(key, patch)).await?;
        media.delete(path).await?;
        Ok(seq)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Flush the current user's state and load `user`'s. Subscribers stay
    /// attached and receive the difference.
    pub async fn switch_user(&self, user: UserId) -> Result<()> {
        Ok(self.handle.switch_user(user).await?)
    }

    /// Stop syncing. Queued writes stay in storage for the next session.
    pub async fn shutdown(&self) -> Result<()> {
        info!(user = %self.user(), "replica shutting down");
        Ok(self.handle.shutdown().await?)
    }
}
