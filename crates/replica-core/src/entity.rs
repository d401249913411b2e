//! Entity: the visible value of one record, and Snapshot: its remote-confirmed state.

use serde::{Deserialize, Serialize};

use crate::types::{EntityKey, Fields, Version};

/// Where the visible value of an entity comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Confirmed by the remote source; no local mutation pending.
    Remote,
    /// At least one local mutation is waiting for confirmation.
    LocalPending,
    /// A local mutation diverged from the remote value and awaits resolution.
    LocalConflicted,
}

impl Origin {
    /// Stable numeric code used by persistent storage.
    pub fn to_u8(self) -> u8 {
        match self {
            Origin::Remote => 0,
            Origin::LocalPending => 1,
            Origin::LocalConflicted => 2,
        }
    }

    /// Parse from the storage code.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Origin::Remote),
            1 => Some(Origin::LocalPending),
            2 => Some(Origin::LocalConflicted),
            _ => None,
        }
    }

    /// Whether a local write is still outstanding.
    pub fn is_local(self) -> bool {
        !matches!(self, Origin::Remote)
    }
}

/// The best-known value of one entity as exposed to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Collection and id.
    pub key: EntityKey,
    /// Current projected field values.
    pub fields: Fields,
    /// Remote version the projection is based on. `None` if never confirmed.
    pub version: Option<Version>,
    /// Provenance of the visible value.
    pub origin: Origin,
}

impl Entity {
    /// Read one field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Whether the visible value is confirmed by the remote source.
    pub fn is_synced(&self) -> bool {
        self.origin == Origin::Remote
    }
}

/// A remote-confirmed state of an entity at a given version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: EntityKey,
    /// `None` when the entity has been deleted remotely (tombstone).
    pub fields: Option<Fields>,
    pub version: Version,
}

impl Snapshot {
    /// A live snapshot.
    pub fn live(key: EntityKey, fields: Fields, version: Version) -> Self {
        Self {
            key,
            fields: Some(fields),
            version,
        }
    }

    /// A remote tombstone.
    pub fn deleted(key: EntityKey, version: Version) -> Self {
        Self {
            key,
            fields: None,
            version,
        }
    }

    /// Whether this snapshot records a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.fields.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_code_roundtrip() {
        for origin in [Origin::Remote, Origin::LocalPending, Origin::LocalConflicted] {
            assert_eq!(Origin::from_u8(origin.to_u8()), Some(origin));
        }
        assert_eq!(Origin::from_u8(9), None);
    }

    #[test]
    fn test_snapshot_tombstone() {
        let key = EntityKey::new("notes", "n1");
        assert!(Snapshot::deleted(key.clone(), Version(3)).is_tombstone());
        assert!(!Snapshot::live(key, Fields::new(), Version(1)).is_tombstone());
    }
}
