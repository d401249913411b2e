//! # Replica Store
//!
//! Durable local state for Replica. Provides a trait-based interface for the
//! mutation queue, the entity cache and terminal failure records, with SQLite
//! and in-memory implementations.
//!
//! ## Overview
//!
//! The synchronization engine never talks to SQLite directly: every write goes
//! through the [`Store`] trait. The primary implementation is [`SqliteStore`],
//! with [`MemoryStore`] for testing.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`PersistedEntity`] - A stored remote snapshot plus its last origin
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replica_core::{EntityKey, MutationDraft, SeqNo, UserId};
//! use replica_store::{SqliteStore, Store};
//!
//! async fn example() {
//!     let store = SqliteStore::open("replica.db").unwrap();
//!     let user = UserId::new("alice");
//!
//!     let m = MutationDraft::delete(EntityKey::new("notes", "n1"))
//!         .into_mutation(SeqNo(1), None, 0);
//!     store.append_mutation(&user, &m).await.unwrap();
//!
//!     // After a restart the queue replays in sequence order.
//!     let queued = store.load_mutations(&user).await.unwrap();
//!     assert_eq!(queued.len(), 1);
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Durable before acknowledged**: a mutation is written before enqueue returns
//! - **Namespaced by user**: every record carries the owning [`UserId`]
//! - **Device-wide sequence**: [`Store::max_seq`] spans all users and failures

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{PersistedEntity, Store};
