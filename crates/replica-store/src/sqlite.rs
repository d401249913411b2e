//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for Replica. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.
//!
//! Field maps are stored as CBOR blobs.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use replica_core::{
    now_millis, CollectionName, EntityKey, FailureRecord, Fields, Mutation, MutationKind,
    MutationOp, MutationState, Origin, SeqNo, Snapshot, UserId, Version,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{PersistedEntity, Store};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection from the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("spawn_blocking failed: {}", e)))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Raw mutation columns, decoded outside the row closure so that
/// payload errors surface as `StoreError`.
struct MutationRow {
    collection: String,
    seq: i64,
    entity_id: String,
    kind: u8,
    payload: Option<Vec<u8>>,
    base_version: Option<i64>,
    timestamp: i64,
    attempts: u32,
    state: u8,
}

const MUTATION_COLUMNS: &str =
    "collection, seq, entity_id, kind, payload, base_version, timestamp, attempts";

fn row_to_mutation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MutationRow> {
    Ok(MutationRow {
        collection: row.get("collection")?,
        seq: row.get("seq")?,
        entity_id: row.get("entity_id")?,
        kind: row.get("kind")?,
        payload: row.get("payload")?,
        base_version: row.get("base_version")?,
        timestamp: row.get("timestamp")?,
        attempts: row.get("attempts")?,
        state: row.get("state")?,
    })
}

impl MutationRow {
    fn into_mutation(self) -> Result<Mutation> {
        let kind = MutationKind::from_u8(self.kind)
            .ok_or(replica_core::CoreError::UnknownKind(self.kind))?;
        let state = MutationState::from_u8(self.state)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown mutation state {}", self.state)))?;
        let payload = match self.payload {
            Some(bytes) => decode_fields(&bytes)?,
            None => Fields::new(),
        };

        Ok(Mutation {
            seq: SeqNo(self.seq as u64),
            key: EntityKey::new(self.collection, self.entity_id),
            op: MutationOp::from_parts(kind, payload),
            base_version: self.base_version.map(|v| Version(v as u64)),
            timestamp: self.timestamp,
            attempts: self.attempts,
            state,
        })
    }
}

fn encode_fields(fields: &Fields) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(fields, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_fields(bytes: &[u8]) -> Result<Fields> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn encode_payload(op: &MutationOp) -> Result<Option<Vec<u8>>> {
    op.payload().map(encode_fields).transpose()
}

#[async_trait]
impl Store for SqliteStore {
    async fn append_mutation(&self, user: &UserId, mutation: &Mutation) -> Result<()> {
        let user = user.clone();
        let m = mutation.clone();
        let payload = encode_payload(&m.op)?;

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO mutations (
                    user_id, collection, seq, entity_id, kind, payload,
                    base_version, timestamp, attempts, state
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    user.as_str(),
                    m.key.collection.as_str(),
                    m.seq.0 as i64,
                    m.key.id.as_str(),
                    m.kind().to_u8(),
                    payload,
                    m.base_version.map(|v| v.0 as i64),
                    m.timestamp,
                    m.attempts,
                    m.state.to_u8(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_mutation(&self, user: &UserId, mutation: &Mutation) -> Result<()> {
        let user = user.clone();
        let m = mutation.clone();
        let payload = encode_payload(&m.op)?;

        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE mutations
                 SET kind = ?4, payload = ?5, base_version = ?6, attempts = ?7, state = ?8
                 WHERE user_id = ?1 AND collection = ?2 AND seq = ?3",
                params![
                    user.as_str(),
                    m.key.collection.as_str(),
                    m.seq.0 as i64,
                    m.kind().to_u8(),
                    payload,
                    m.base_version.map(|v| v.0 as i64),
                    m.attempts,
                    m.state.to_u8(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("mutation {}", m.seq)));
            }
            Ok(())
        })
        .await
    }

    async fn remove_mutation(
        &self,
        user: &UserId,
        collection: &CollectionName,
        seq: SeqNo,
    ) -> Result<bool> {
        let user = user.clone();
        let collection = collection.clone();

        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM mutations WHERE user_id = ?1 AND collection = ?2 AND seq = ?3",
                params![user.as_str(), collection.as_str(), seq.0 as i64],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn load_mutations(&self, user: &UserId) -> Result<Vec<Mutation>> {
        let user = user.clone();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MUTATION_COLUMNS}, state FROM mutations
                 WHERE user_id = ?1 ORDER BY seq"
            ))?;
            let rows = stmt
                .query_map(params![user.as_str()], row_to_mutation_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter().map(MutationRow::into_mutation).collect()
        })
        .await
    }

    async fn max_seq(&self) -> Result<Option<SeqNo>> {
        self.blocking(|conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(seq) FROM (
                    SELECT seq FROM mutations
                    UNION ALL
                    SELECT seq FROM failures
                 )",
                [],
                |row| row.get(0),
            )?;
            Ok(max.map(|s| SeqNo(s as u64)))
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entity Cache
    // ─────────────────────────────────────────────────────────────────────────

    async fn put_entity(&self, user: &UserId, entity: &PersistedEntity) -> Result<()> {
        let user = user.clone();
        let snapshot = entity.snapshot.clone();
        let origin = entity.origin;
        let fields = snapshot.fields.as_ref().map(encode_fields).transpose()?;

        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO entities (
                    user_id, collection, entity_id, fields, version, origin, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user.as_str(),
                    snapshot.key.collection.as_str(),
                    snapshot.key.id.as_str(),
                    fields,
                    snapshot.version.0 as i64,
                    origin.to_u8(),
                    now_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_entity(&self, user: &UserId, key: &EntityKey) -> Result<()> {
        let user = user.clone();
        let key = key.clone();

        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM entities WHERE user_id = ?1 AND collection = ?2 AND entity_id = ?3",
                params![user.as_str(), key.collection.as_str(), key.id.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_entities(&self, user: &UserId) -> Result<Vec<PersistedEntity>> {
        let user = user.clone();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT collection, entity_id, fields, version, origin FROM entities
                 WHERE user_id = ?1 ORDER BY collection, entity_id",
            )?;
            let rows = stmt
                .query_map(params![user.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, u8>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(collection, id, fields, version, origin)| {
                    let origin = Origin::from_u8(origin)
                        .ok_or_else(|| StoreError::InvalidData(format!("unknown origin {origin}")))?;
                    let fields = fields.as_deref().map(decode_fields).transpose()?;
                    Ok(PersistedEntity {
                        snapshot: Snapshot {
                            key: EntityKey::new(collection, id),
                            fields,
                            version: Version(version as u64),
                        },
                        origin,
                    })
                })
                .collect()
        })
        .await
    }

    async fn clear_entities(&self, user: &UserId) -> Result<()> {
        let user = user.clone();

        self.blocking(move |conn| {
            conn.execute("DELETE FROM entities WHERE user_id = ?1", params![user.as_str()])?;
            Ok(())
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Failure Records
    // ─────────────────────────────────────────────────────────────────────────

    async fn record_failure(&self, user: &UserId, record: &FailureRecord) -> Result<()> {
        let user = user.clone();
        let record = record.clone();
        let payload = encode_payload(&record.mutation.op)?;

        self.blocking(move |conn| {
            let m = &record.mutation;
            conn.execute(
                "INSERT OR REPLACE INTO failures (
                    user_id, seq, collection, entity_id, kind, payload,
                    base_version, timestamp, attempts, reason, failed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    user.as_str(),
                    m.seq.0 as i64,
                    m.key.collection.as_str(),
                    m.key.id.as_str(),
                    m.kind().to_u8(),
                    payload,
                    m.base_version.map(|v| v.0 as i64),
                    m.timestamp,
                    m.attempts,
                    record.reason,
                    record.failed_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_failures(&self, user: &UserId) -> Result<Vec<FailureRecord>> {
        let user = user.clone();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MUTATION_COLUMNS}, 0 AS state, reason, failed_at FROM failures
                 WHERE user_id = ?1 ORDER BY seq"
            ))?;
            let rows = stmt
                .query_map(params![user.as_str()], row_to_failure_parts)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter().map(failure_from_parts).collect()
        })
        .await
    }

    async fn take_failure(&self, user: &UserId, seq: SeqNo) -> Result<Option<FailureRecord>> {
        let user = user.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let parts = tx
                .query_row(
                    &format!(
                        "SELECT {MUTATION_COLUMNS}, 0 AS state, reason, failed_at FROM failures
                         WHERE user_id = ?1 AND seq = ?2"
                    ),
                    params![user.as_str(), seq.0 as i64],
                    row_to_failure_parts,
                )
                .optional()?;

            if parts.is_some() {
                tx.execute(
                    "DELETE FROM failures WHERE user_id = ?1 AND seq = ?2",
                    params![user.as_str(), seq.0 as i64],
                )?;
            }
            tx.commit()?;

            parts.map(failure_from_parts).transpose()
        })
        .await
    }
}

fn row_to_failure_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<(MutationRow, String, i64)> {
    Ok((
        row_to_mutation_row(row)?,
        row.get("reason")?,
        row.get("failed_at")?,
    ))
}

fn failure_from_parts((row, reason, failed_at): (MutationRow, String, i64)) -> Result<FailureRecord> {
    Ok(FailureRecord {
        mutation: row.into_mutation()?,
        reason,
        failed_at,
    })
}
