//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use replica_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "schema migrated");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Durable mutation queue, one row per queued mutation
        CREATE TABLE mutations (
            user_id TEXT NOT NULL,
            collection TEXT NOT NULL,
            seq INTEGER NOT NULL,             -- device-wide sequence number
            entity_id TEXT NOT NULL,
            kind INTEGER NOT NULL,            -- MutationKind as u8
            payload BLOB,                     -- CBOR field map, NULL for DELETE
            base_version INTEGER,             -- NULL when never confirmed remotely
            timestamp INTEGER NOT NULL,       -- creation time (Unix ms)
            attempts INTEGER NOT NULL DEFAULT 0,
            state INTEGER NOT NULL DEFAULT 0, -- MutationState as u8
            PRIMARY KEY (user_id, collection, seq)
        );

        -- Remote snapshots backing the entity cache
        CREATE TABLE entities (
            user_id TEXT NOT NULL,
            collection TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            fields BLOB,                      -- CBOR field map, NULL for tombstones
            version INTEGER NOT NULL,
            origin INTEGER NOT NULL,          -- Origin as u8
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, collection, entity_id)
        );

        -- Mutations that exhausted their retry budget or were rejected
        CREATE TABLE failures (
            user_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            collection TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            kind INTEGER NOT NULL,
            payload BLOB,
            base_version INTEGER,
            timestamp INTEGER NOT NULL,
            attempts INTEGER NOT NULL,
            reason TEXT NOT NULL,
            failed_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, seq)
        );

        CREATE INDEX idx_mutations_user_seq ON mutations(user_id, seq);
        CREATE INDEX idx_mutations_seq ON mutations(seq);
        CREATE INDEX idx_failures_seq ON failures(seq);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"mutations".to_string()));
        assert!(tables.contains(&"entities".to_string()));
        assert!(tables.contains(&"failures".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_newer_schema_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, 0)",
            [CURRENT_VERSION + 1],
        )
        .unwrap();

        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }
}
