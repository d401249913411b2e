//! Events flowing into and out of the synchronization core.
//!
//! Inbound: [`RemoteEvent`]s pushed by the remote source's snapshot streams.
//! Outbound: [`ChangeBatch`]es delivered to subscribers, which carry
//! [`FailureNotice`]s for conflicts and terminal failures.

use serde::{Deserialize, Serialize};

use replica_core::{Entity, EntityKey, FailureRecord, Fields, SeqNo, Snapshot, Version};

/// How a remote entity changed, as reported by a snapshot stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change pushed by a remote snapshot stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub snapshot: Snapshot,
    pub kind: ChangeKind,
}

impl RemoteEvent {
    pub fn added(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            kind: ChangeKind::Added,
        }
    }

    pub fn modified(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            kind: ChangeKind::Modified,
        }
    }

    pub fn removed(key: EntityKey, version: Version) -> Self {
        Self {
            snapshot: Snapshot::deleted(key, version),
            kind: ChangeKind::Removed,
        }
    }
}

/// A local mutation diverged from the remote value.
///
/// Further submissions for the entity are halted until the conflict is
/// resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEvent {
    pub key: EntityKey,
    /// The locally projected value when the conflict was detected.
    /// `None` if the local intent was a deletion.
    pub local: Option<Fields>,
    /// The remote value. `None` if the entity was deleted remotely.
    pub remote: Option<Fields>,
    /// Remote version the conflict was detected against.
    pub remote_version: Option<Version>,
    /// Queued mutations halted by the conflict.
    pub seqs: Vec<SeqNo>,
}

/// A failure surfaced to observers through change batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureNotice {
    /// Needs an explicit `resolve_conflict`.
    Conflict(ConflictEvent),
    /// Removed from the queue; can be retried or dismissed.
    Terminal(FailureRecord),
}

impl FailureNotice {
    /// The entity the failure concerns.
    pub fn key(&self) -> &EntityKey {
        match self {
            FailureNotice::Conflict(c) => &c.key,
            FailureNotice::Terminal(r) => &r.mutation.key,
        }
    }
}

/// Identifies a subscription within its hub.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SubscriptionId(pub u64);

/// A minimal diff of a subscription's window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeBatch {
    pub subscription: SubscriptionId,
    /// Entities that entered the window.
    pub added: Vec<Entity>,
    /// Entities that stayed in the window but changed value, version or origin.
    pub updated: Vec<Entity>,
    /// Entities that left the window.
    pub removed: Vec<EntityKey>,
    /// The full window after the change, in query order.
    pub order: Vec<EntityKey>,
    /// Conflicts and terminal failures for the subscribed collection.
    pub failures: Vec<FailureNotice>,
}

impl ChangeBatch {
    /// Whether the batch carries no entity changes and no failures.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.failures.is_empty()
    }
}
