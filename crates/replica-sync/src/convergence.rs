//! Projection digests for convergence checks.
//!
//! Once the queue is drained and the snapshot streams are caught up, the
//! local projection of a collection must equal the remote state. Comparing
//! two [`ProjectionDigest`]s is a cheap way to verify that.
//!
//! The digest covers the collection name and the canonical bytes of every
//! live entity in id order. A visible entity and the live snapshot it was
//! projected from encode to the same bytes, so both sides hash identically.

use std::fmt;

use replica_core::{canonical_entity_bytes, canonical_snapshot_bytes, CollectionName, Entity, Snapshot};

const DOMAIN: &[u8] = b"replica-projection-v0:";

/// blake3 digest of a collection's live entities.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProjectionDigest(pub [u8; 32]);

impl ProjectionDigest {
    /// Digest of local entities. They must be ordered by id, as
    /// [`EntityCache::entities`](crate::cache::EntityCache::entities) yields them.
    pub fn of_entities<'a>(
        collection: &CollectionName,
        entities: impl IntoIterator<Item = &'a Entity>,
    ) -> Self {
        let mut hasher = Self::hasher(collection);
        for entity in entities {
            Self::absorb(&mut hasher, &canonical_entity_bytes(entity));
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Digest of remote snapshots, ordered by id. Tombstones are skipped.
    pub fn of_snapshots(collection: &CollectionName, snapshots: &[Snapshot]) -> Self {
        let mut hasher = Self::hasher(collection);
        for snapshot in snapshots.iter().filter(|s| !s.is_tombstone()) {
            Self::absorb(&mut hasher, &canonical_snapshot_bytes(snapshot));
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn hasher(collection: &CollectionName) -> blake3::Hasher {
        let mut hasher = blake3::Hasher::new();
        hasher.update(DOMAIN);
        Self::absorb(&mut hasher, collection.as_str().as_bytes());
        hasher
    }

    /// Length-prefixed so that record boundaries are unambiguous.
    fn absorb(hasher: &mut blake3::Hasher, bytes: &[u8]) {
        hasher.update(&(bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
}

impl fmt::Debug for ProjectionDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProjectionDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ProjectionDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
