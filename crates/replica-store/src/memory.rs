//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use replica_core::{
    CollectionName, EntityKey, FailureRecord, Mutation, SeqNo, UserId,
};

use crate::error::{Result, StoreError};
use crate::traits::{PersistedEntity, Store};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Queued mutations: user -> seq -> mutation.
    mutations: HashMap<UserId, BTreeMap<SeqNo, Mutation>>,

    /// Entity records: user -> key -> record.
    entities: HashMap<UserId, BTreeMap<EntityKey, PersistedEntity>>,

    /// Terminal failures: user -> seq -> record.
    failures: HashMap<UserId, BTreeMap<SeqNo, FailureRecord>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_mutation(&self, user: &UserId, mutation: &Mutation) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .mutations
            .entry(user.clone())
            .or_default()
            .insert(mutation.seq, mutation.clone());
        Ok(())
    }

    async fn update_mutation(&self, user: &UserId, mutation: &Mutation) -> Result<()> {
        let mut inner = self.write()?;
        let slot = inner
            .mutations
            .get_mut(user)
            .and_then(|queue| queue.get_mut(&mutation.seq))
            .ok_or_else(|| StoreError::NotFound(format!("mutation {}", mutation.seq)))?;
        *slot = mutation.clone();
        Ok(())
    }

    async fn remove_mutation(
        &self,
        user: &UserId,
        collection: &CollectionName,
        seq: SeqNo,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        let Some(queue) = inner.mutations.get_mut(user) else {
            return Ok(false);
        };

        match queue.get(&seq) {
            Some(m) if &m.key.collection == collection => {
                queue.remove(&seq);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn load_mutations(&self, user: &UserId) -> Result<Vec<Mutation>> {
        let inner = self.read()?;
        Ok(inner
            .mutations
            .get(user)
            .map(|queue| queue.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn max_seq(&self) -> Result<Option<SeqNo>> {
        let inner = self.read()?;
        let queued = inner
            .mutations
            .values()
            .filter_map(|queue| queue.keys().next_back().copied());
        let failed = inner
            .failures
            .values()
            .filter_map(|records| records.keys().next_back().copied());
        Ok(queued.chain(failed).max())
    }

    async fn put_entity(&self, user: &UserId, entity: &PersistedEntity) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .entities
            .entry(user.clone())
            .or_default()
            .insert(entity.snapshot.key.clone(), entity.clone());
        Ok(())
    }

    async fn remove_entity(&self, user: &UserId, key: &EntityKey) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(entities) = inner.entities.get_mut(user) {
            entities.remove(key);
        }
        Ok(())
    }

    async fn load_entities(&self, user: &UserId) -> Result<Vec<PersistedEntity>> {
        let inner = self.read()?;
        Ok(inner
            .entities
            .get(user)
            .map(|entities| entities.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_entities(&self, user: &UserId) -> Result<()> {
        let mut inner = self.write()?;
        inner.entities.remove(user);
        Ok(())
    }

    async fn record_failure(&self, user: &UserId, record: &FailureRecord) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .failures
            .entry(user.clone())
            .or_default()
            .insert(record.mutation.seq, record.clone());
        Ok(())
    }

    async fn list_failures(&self, user: &UserId) -> Result<Vec<FailureRecord>> {
        let inner = self.read()?;
        Ok(inner
            .failures
            .get(user)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn take_failure(&self, user: &UserId, seq: SeqNo) -> Result<Option<FailureRecord>> {
        let mut inner = self.write()?;
        Ok(inner
            .failures
            .get_mut(user)
            .and_then(|records| records.remove(&seq)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_core::{MutationDraft, Origin, Snapshot, Version};

    fn make_mutation(seq: u64, id: &str) -> Mutation {
        MutationDraft::delete(EntityKey::new("notes", id)).into_mutation(
            SeqNo(seq),
            Some(Version(1)),
            1_700_000_000_000,
        )
    }

    #[tokio::test]
    async fn test_memory_store_queue_order() {
        let store = MemoryStore::new();
        let user = UserId::new("alice");

        store.append_mutation(&user, &make_mutation(3, "c")).await.unwrap();
        store.append_mutation(&user, &make_mutation(1, "a")).await.unwrap();
        store.append_mutation(&user, &make_mutation(2, "b")).await.unwrap();

        let seqs: Vec<_> = store
            .load_mutations(&user)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.seq)
            .collect();
        assert_eq!(seqs, vec![SeqNo(1), SeqNo(2), SeqNo(3)]);
        assert_eq!(store.max_seq().await.unwrap(), Some(SeqNo(3)));
    }

    #[tokio::test]
    async fn test_memory_store_remove_idempotent() {
        let store = MemoryStore::new();
        let user = UserId::new("alice");
        let m = make_mutation(1, "a");
        store.append_mutation(&user, &m).await.unwrap();

        let collection = CollectionName::new("notes");
        assert!(store.remove_mutation(&user, &collection, m.seq).await.unwrap());
        assert!(!store.remove_mutation(&user, &collection, m.seq).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_users_isolated() {
        let store = MemoryStore::new();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        store.append_mutation(&alice, &make_mutation(1, "a")).await.unwrap();
        store
            .put_entity(
                &alice,
                &PersistedEntity {
                    snapshot: Snapshot::deleted(EntityKey::new("notes", "a"), Version(2)),
                    origin: Origin::Remote,
                },
            )
            .await
            .unwrap();

        assert!(store.load_mutations(&bob).await.unwrap().is_empty());
        assert!(store.load_entities(&bob).await.unwrap().is_empty());
        assert_eq!(store.load_entities(&alice).await.unwrap().len(), 1);
    }
}
