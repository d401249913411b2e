//! Entity cache: the best-known value of every entity.
//!
//! Each slot keeps the last applied remote snapshot (the shadow) and the
//! visible projection computed from it:
//!
//! ```text
//! visible = apply_patches(shadow, pending_ops)
//! ```
//!
//! Local intent wins visibility until the remote round-trip completes; the
//! shadow is what conflicts are detected and resolved against.
//!
//! The cache holds no reference to the queue. Callers pass a [`PendingView`]
//! of the entity's queued operations whenever a slot has to be recomputed.

use std::collections::BTreeMap;

use replica_core::{
    apply_op, apply_patches, CollectionName, Entity, EntityKey, MutationOp, Origin, Query,
    Snapshot, Version,
};
use replica_store::PersistedEntity;

/// Queued operations of one entity, oldest first.
#[derive(Debug, Clone, Default)]
pub struct PendingView<'a> {
    pub ops: Vec<&'a MutationOp>,
    /// Whether any of them is halted by a conflict.
    pub conflicted: bool,
}

impl PendingView<'_> {
    fn origin(&self) -> Origin {
        if self.ops.is_empty() {
            Origin::Remote
        } else if self.conflicted {
            Origin::LocalConflicted
        } else {
            Origin::LocalPending
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    shadow: Option<Snapshot>,
    visible: Option<Entity>,
}

/// In-memory entity cache.
#[derive(Debug, Default)]
pub struct EntityCache {
    slots: BTreeMap<EntityKey, Slot>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted shadows. Call [`EntityCache::recompute`] for
    /// every entity with queued mutations afterwards.
    pub fn load(records: impl IntoIterator<Item = PersistedEntity>) -> Self {
        let mut cache = Self::new();
        for record in records {
            let key = record.snapshot.key.clone();
            cache.slots.insert(
                key.clone(),
                Slot {
                    shadow: Some(record.snapshot),
                    visible: None,
                },
            );
            cache.recompute(&key, &PendingView::default());
        }
        cache
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a remote snapshot as the entity's shadow.
    ///
    /// With no pending mutation the snapshot becomes the visible value;
    /// otherwise the pending mutations are replayed on top of it. Snapshots
    /// older than the current shadow are ignored and `false` is returned.
    pub fn apply_remote_snapshot(&mut self, snapshot: Snapshot, pending: &PendingView<'_>) -> bool {
        let key = snapshot.key.clone();
        let slot = self.slots.entry(key.clone()).or_default();
        if slot
            .shadow
            .as_ref()
            .is_some_and(|current| current.version > snapshot.version)
        {
            return false;
        }
        slot.shadow = Some(snapshot);
        self.recompute(&key, pending);
        true
    }

    /// Project a newly queued mutation. `pending` must already include it.
    pub fn apply_local_mutation(&mut self, key: &EntityKey, pending: &PendingView<'_>) {
        self.recompute(key, pending);
    }

    /// A mutation was confirmed at `version`: advance the shadow by applying
    /// it, unless a snapshot at least that recent already arrived.
    pub fn commit(
        &mut self,
        key: &EntityKey,
        op: &MutationOp,
        version: Version,
        pending: &PendingView<'_>,
    ) {
        let slot = self.slots.entry(key.clone()).or_default();
        let stale = slot
            .shadow
            .as_ref()
            .map_or(true, |shadow| shadow.version < version);
        if stale {
            let base = slot.shadow.as_ref().and_then(|s| s.fields.as_ref());
            slot.shadow = Some(Snapshot {
                key: key.clone(),
                fields: apply_op(base, op),
                version,
            });
        }
        self.recompute(key, pending);
    }

    /// Recompute the visible value of an entity from its shadow and pending
    /// operations. Slots with neither are removed.
    pub fn recompute(&mut self, key: &EntityKey, pending: &PendingView<'_>) {
        if !self.slots.contains_key(key) {
            if pending.ops.is_empty() {
                return;
            }
            self.slots.insert(key.clone(), Slot::default());
        }
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };

        let base = slot.shadow.as_ref().and_then(|s| s.fields.as_ref());
        let projected = apply_patches(base, pending.ops.iter().copied());
        slot.visible = projected.map(|fields| Entity {
            key: key.clone(),
            fields,
            version: slot.shadow.as_ref().map(|s| s.version),
            origin: pending.origin(),
        });

        if slot.shadow.is_none() && slot.visible.is_none() {
            self.slots.remove(key);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// The visible value of an entity.
    pub fn get(&self, key: &EntityKey) -> Option<&Entity> {
        self.slots.get(key).and_then(|slot| slot.visible.as_ref())
    }

    /// The last applied remote snapshot, tombstones included.
    pub fn shadow(&self, key: &EntityKey) -> Option<&Snapshot> {
        self.slots.get(key).and_then(|slot| slot.shadow.as_ref())
    }

    /// Version of the last applied remote snapshot.
    pub fn remote_version(&self, key: &EntityKey) -> Option<Version> {
        self.shadow(key).map(|s| s.version)
    }

    /// Visible entities of a collection, ordered by id.
    pub fn entities<'a>(&'a self, collection: &'a CollectionName) -> impl Iterator<Item = &'a Entity> + 'a {
        self.slots
            .iter()
            .filter(move |(key, _)| &key.collection == collection)
            .filter_map(|(_, slot)| slot.visible.as_ref())
    }

    /// Evaluate a query over the current state.
    pub fn query(&self, query: &Query) -> Vec<Entity> {
        query.evaluate(self.entities(&query.collection))
    }

    /// The record to persist for an entity, if it has a shadow.
    pub fn persisted(&self, key: &EntityKey) -> Option<PersistedEntity> {
        let slot = self.slots.get(key)?;
        let snapshot = slot.shadow.clone()?;
        Some(PersistedEntity {
            snapshot,
            origin: slot
                .visible
                .as_ref()
                .map_or(Origin::Remote, |entity| entity.origin),
        })
    }

    /// Number of visible entities.
    pub fn len(&self) -> usize {
        self.slots.values().filter(|s| s.visible.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
