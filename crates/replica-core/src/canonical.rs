//! Canonical CBOR encoding for deterministic digests.
//!
//! Same rules as RFC 8949 Core Deterministic Encoding:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - Floats always encoded as 64-bit
//!
//! Two replicas holding the same projection produce identical bytes, and thus
//! identical digests. Origin is not part of the encoding: it is local state.

use ciborium::value::Value;
use serde_json::Value as Json;

use crate::entity::{Entity, Snapshot};
use crate::types::{EntityKey, Fields, Version};

/// Entity field keys (integer keys for compact encoding).
mod keys {
    pub const COLLECTION: u64 = 0;
    pub const ID: u64 = 1;
    pub const VERSION: u64 = 2;
    pub const FIELDS: u64 = 3;
}

/// Encode the visible value of an entity.
pub fn canonical_entity_bytes(entity: &Entity) -> Vec<u8> {
    let value = record_to_cbor_value(&entity.key, entity.version, Some(&entity.fields));
    encode_cbor_value_canonical(&value)
}

/// Encode a remote snapshot. Tombstones encode `fields` as null.
pub fn canonical_snapshot_bytes(snapshot: &Snapshot) -> Vec<u8> {
    let value = record_to_cbor_value(&snapshot.key, Some(snapshot.version), snapshot.fields.as_ref());
    encode_cbor_value_canonical(&value)
}

fn record_to_cbor_value(key: &EntityKey, version: Option<Version>, fields: Option<&Fields>) -> Value {
    let version = match version {
        Some(v) => Value::Integer(v.0.into()),
        None => Value::Null,
    };
    let fields = match fields {
        Some(f) => fields_to_cbor_value(f),
        None => Value::Null,
    };

    Value::Map(vec![
        (
            Value::Integer(keys::COLLECTION.into()),
            Value::Text(key.collection.as_str().to_string()),
        ),
        (
            Value::Integer(keys::ID.into()),
            Value::Text(key.id.as_str().to_string()),
        ),
        (Value::Integer(keys::VERSION.into()), version),
        (Value::Integer(keys::FIELDS.into()), fields),
    ])
}

fn fields_to_cbor_value(fields: &Fields) -> Value {
    Value::Map(
        fields
            .iter()
            .map(|(k, v)| (Value::Text(k.clone()), json_to_cbor_value(v)))
            .collect(),
    )
}

fn json_to_cbor_value(json: &Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i.into())
            } else if let Some(u) = n.as_u64() {
                Value::Integer(u.into())
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => Value::Text(s.clone()),
        Json::Array(items) => Value::Array(items.iter().map(json_to_cbor_value).collect()),
        Json::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (Value::Text(k.clone()), json_to_cbor_value(v)))
                .collect(),
        ),
    }
}

/// Encode a CBOR Value to canonical bytes.
fn encode_cbor_value_canonical(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => {
            encode_uint(buf, 2, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::Text(s) => {
            encode_uint(buf, 3, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(arr) => {
            encode_uint(buf, 4, arr.len() as u64);
            for item in arr {
                encode_value_to(buf, item);
            }
        }
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Float(f) => {
            buf.push(0xfb);
            buf.extend_from_slice(&f.to_be_bytes());
        }
        // Tags and other simple values are never produced from JSON.
        _ => buf.push(0xf6),
    }
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();

    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        let abs = (-1 - n) as u64;
        encode_uint(buf, 1, abs);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffffffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Encode a map canonically (major type 5).
///
/// Keys are sorted by their encoded byte comparison.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut key_value_pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| {
            let mut key_buf = Vec::new();
            encode_value_to(&mut key_buf, k);
            (key_buf, v)
        })
        .collect();

    key_value_pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, key_value_pairs.len() as u64);
    for (key_bytes, value) in key_value_pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Origin;
    use serde_json::json;

    fn entity(origin: Origin) -> Entity {
        Entity {
            key: EntityKey::new("notes", "n1"),
            fields: [
                ("title".to_string(), json!("hello")),
                ("pinned".to_string(), json!(true)),
                ("rating".to_string(), json!(4.5)),
                ("tags".to_string(), json!(["a", {"z": 1, "b": -2}])),
            ]
            .into_iter()
            .collect(),
            version: Some(Version(7)),
            origin,
        }
    }

    #[test]
    fn test_encoding_deterministic() {
        assert_eq!(
            canonical_entity_bytes(&entity(Origin::Remote)),
            canonical_entity_bytes(&entity(Origin::Remote))
        );
    }

    #[test]
    fn test_origin_not_encoded() {
        assert_eq!(
            canonical_entity_bytes(&entity(Origin::Remote)),
            canonical_entity_bytes(&entity(Origin::LocalPending))
        );
    }

    #[test]
    fn test_entity_matches_live_snapshot() {
        let e = entity(Origin::Remote);
        let s = Snapshot::live(e.key.clone(), e.fields.clone(), Version(7));
        assert_eq!(canonical_entity_bytes(&e), canonical_snapshot_bytes(&s));
    }

    #[test]
    fn test_small_integer_encoding() {
        let mut buf = Vec::new();
        encode_uint(&mut buf, 0, 10);
        assert_eq!(buf, vec![0x0a]);

        let mut buf = Vec::new();
        encode_uint(&mut buf, 0, 500);
        assert_eq!(buf, vec![0x19, 0x01, 0xf4]);
    }
}
