//! # Replica
//!
//! The unified API of the Replica system: an offline-first, optimistic
//! local copy of a user's collections, kept in sync with a hosted database.
//!
//! ## Overview
//!
//! Replica provides a portable library for:
//!
//! - **Writes**: Applied locally at once, queued durably, synced in order
//! - **Reads**: Point lookups and queries over the merged local projection
//! - **Subscriptions**: Coalesced change batches for UI observers
//! - **Conflicts**: Surfaced for explicit resolution, never merged silently
//! - **Sessions**: State namespaced per user, switched on sign-in/sign-out
//!
//! ## Key Concepts
//!
//! - **Mutation**: A local write. Sequence numbers are device-wide.
//! - **Snapshot**: The remote-confirmed state of an entity.
//! - **Projection**: Snapshot plus queued mutations. This is what reads see.
//! - **Conflict**: A write whose base version was overtaken remotely.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replica::{Replica, ReplicaConfig};
//! use replica::core::{Query, UserId};
//! use replica::store::SqliteStore;
//! use replica::sync::MemoryBackend;
//!
//! async fn example() -> replica::Result<()> {
//!     // Open durable storage
//!     let store = Arc::new(SqliteStore::open("replica.db")?);
//!
//!     // Open the replica for the signed-in user
//!     let replica = Replica::open(
//!         UserId::new("alice"),
//!         store,
//!         MemoryBackend::new(),
//!         ReplicaConfig::default(),
//!     )
//!     .await?;
//!
//!     // Observe a collection
//!     let (_id, mut batches) = replica.subscribe(Query::collection("notes"))?;
//!
//!     // Write optimistically
//!     let _key = replica.create("notes", Default::default()).await?;
//!     let _batch = batches.recv().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `replica::core` - Data model (Entity, Mutation, Query, etc.)
//! - `replica::store` - Storage abstraction and SQLite
//! - `replica::sync` - Synchronization core and remote source adapter

pub mod error;
pub mod media;
pub mod replica;
pub mod session;

// Re-export component crates
pub use replica_core as core;
pub use replica_store as store;
pub use replica_sync as sync;

// Re-export main types for convenience
pub use error::{ReplicaError, Result};
pub use media::{MediaError, MediaStore, MemoryMediaStore};
pub use replica::{Replica, ReplicaConfig};
pub use session::{AuthSource, MemoryAuth, Session};

// Re-export commonly used types
pub use replica_core::{
    CollectionName, Direction, Entity, EntityKey, Fields, Filter, Origin, Query, SeqNo, UserId,
    Version,
};
pub use replica_sync::{ChangeBatch, ConflictEvent, SubscriptionId, SyncConfig, SyncStatus};
