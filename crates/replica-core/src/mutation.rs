//! Mutation: the unit of local intent.
//!
//! A mutation is created on a user action, enqueued, attempted against the
//! remote source, and finally committed, surfaced as a conflict, or recorded
//! as a terminal failure.

use serde::{Deserialize, Serialize};

use crate::types::{CollectionName, EntityId, EntityKey, Fields, SeqNo, Version};

/// Discriminator for a mutation's operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    /// Stable numeric code used by persistent storage.
    pub fn to_u8(self) -> u8 {
        match self {
            MutationKind::Create => 0,
            MutationKind::Update => 1,
            MutationKind::Delete => 2,
        }
    }

    /// Parse from the storage code.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(MutationKind::Create),
            1 => Some(MutationKind::Update),
            2 => Some(MutationKind::Delete),
            _ => None,
        }
    }
}

/// The operation a mutation performs on its target entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationOp {
    /// Create the entity with the given fields.
    Create { fields: Fields },
    /// Merge a partial patch into the entity. A `null` value removes the field.
    Update { patch: Fields },
    /// Delete the entity.
    Delete,
}

impl MutationOp {
    /// The operation's kind.
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationOp::Create { .. } => MutationKind::Create,
            MutationOp::Update { .. } => MutationKind::Update,
            MutationOp::Delete => MutationKind::Delete,
        }
    }

    /// The field map carried by the operation (empty for DELETE).
    pub fn payload(&self) -> Option<&Fields> {
        match self {
            MutationOp::Create { fields } => Some(fields),
            MutationOp::Update { patch } => Some(patch),
            MutationOp::Delete => None,
        }
    }

    /// Rebuild an operation from its kind and stored payload.
    pub fn from_parts(kind: MutationKind, payload: Fields) -> Self {
        match kind {
            MutationKind::Create => MutationOp::Create { fields: payload },
            MutationKind::Update => MutationOp::Update { patch: payload },
            MutationKind::Delete => MutationOp::Delete,
        }
    }
}

/// Lifecycle state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationState {
    /// Waiting to be (re)submitted.
    Pending,
    /// Submitted; awaiting the remote outcome.
    InFlight,
    /// The remote version moved under it. Halted until resolved.
    Conflicted,
}

impl MutationState {
    /// Stable numeric code used by persistent storage.
    pub fn to_u8(self) -> u8 {
        match self {
            MutationState::Pending => 0,
            MutationState::InFlight => 1,
            MutationState::Conflicted => 2,
        }
    }

    /// Parse from the storage code.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(MutationState::Pending),
            1 => Some(MutationState::InFlight),
            2 => Some(MutationState::Conflicted),
            _ => None,
        }
    }
}

/// A mutation as issued by a caller, before it has a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationDraft {
    pub key: EntityKey,
    pub op: MutationOp,
}

impl MutationDraft {
    /// CREATE with a freshly generated entity id.
    pub fn create(collection: impl Into<CollectionName>, fields: Fields) -> Self {
        Self::create_with_id(EntityKey {
            collection: collection.into(),
            id: EntityId::generate(),
        }, fields)
    }

    /// CREATE with a caller-chosen id.
    pub fn create_with_id(key: EntityKey, fields: Fields) -> Self {
        Self {
            key,
            op: MutationOp::Create { fields },
        }
    }

    /// UPDATE with a partial patch.
    pub fn update(key: EntityKey, patch: Fields) -> Self {
        Self {
            key,
            op: MutationOp::Update { patch },
        }
    }

    /// DELETE.
    pub fn delete(key: EntityKey) -> Self {
        Self {
            key,
            op: MutationOp::Delete,
        }
    }

    /// Turn the draft into a queued mutation.
    pub fn into_mutation(self, seq: SeqNo, base_version: Option<Version>, timestamp: i64) -> Mutation {
        Mutation {
            seq,
            key: self.key,
            op: self.op,
            base_version,
            timestamp,
            attempts: 0,
            state: MutationState::Pending,
        }
    }
}

/// A local write waiting for remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Device-wide sequence number.
    pub seq: SeqNo,
    /// Target entity.
    pub key: EntityKey,
    /// What to do.
    pub op: MutationOp,
    /// Remote version the mutation was based on (optimistic concurrency token).
    pub base_version: Option<Version>,
    /// Creation time (Unix ms).
    pub timestamp: i64,
    /// Failed attempts counted against the retry budget.
    pub attempts: u32,
    /// Lifecycle state.
    pub state: MutationState,
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        self.op.kind()
    }

    /// Back to a draft, e.g. to re-enqueue after a terminal failure.
    pub fn to_draft(&self) -> MutationDraft {
        MutationDraft {
            key: self.key.clone(),
            op: self.op.clone(),
        }
    }
}

/// A mutation that will not be retried automatically.
///
/// Kept in durable storage so the user can retry or dismiss it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub mutation: Mutation,
    pub reason: String,
    /// When the failure became terminal (Unix ms).
    pub failed_at: i64,
}
