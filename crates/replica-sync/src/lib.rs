//! # Replica Sync
//!
//! The synchronization core: keeps a local, optimistic view of a user's
//! collections in step with a hosted database.
//!
//! ## Components
//!
//! - [`MutationQueue`] - durable, ordered log of local writes awaiting
//!   confirmation
//! - [`EntityCache`] - best-known value of every entity, merging remote
//!   snapshots with queued mutations
//! - [`SubscriptionHub`] - coalesced, minimal-diff change batches for
//!   observers
//! - [`SyncEngine`] - the task that ties them to a [`RemoteSource`]
//!
//! ## Mutation lifecycle
//!
//! ```text
//! PENDING ──▶ IN_FLIGHT ──▶ COMMITTED
//!    ▲            │
//!    └── retry ◀──┼──▶ CONFLICT (halted until resolve_conflict)
//!                 └──▶ TERMINAL (removed, failure record kept)
//! ```
//!
//! Local intent wins visibility: a queued mutation is visible immediately
//! and stays visible until the remote source settles it. Conflicts are never
//! merged silently; they are surfaced as [`ConflictEvent`]s.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replica_core::{MutationDraft, Query, UserId};
//! use replica_store::MemoryStore;
//! use replica_sync::{MemoryBackend, SyncConfig, SyncEngine};
//!
//! async fn example() -> replica_sync::Result<()> {
//!     let handle = SyncEngine::spawn(
//!         UserId::new("alice"),
//!         Arc::new(MemoryStore::new()),
//!         MemoryBackend::new(),
//!         SyncConfig::default(),
//!     )
//!     .await?;
//!
//!     let (_id, mut batches) = handle.subscribe(Query::collection("notes"))?;
//!     let seq = handle
//!         .enqueue(MutationDraft::create("notes", Default::default()))
//!         .await?;
//!     handle.confirm(seq).await?;
//!     let _batch = batches.recv().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod cache;
pub mod convergence;
pub mod engine;
pub mod error;
pub mod events;
pub mod hub;
pub mod queue;
pub mod source;

pub use backoff::BackoffConfig;
pub use cache::{EntityCache, PendingView};
pub use convergence::ProjectionDigest;
pub use engine::{SyncConfig, SyncEngine, SyncHandle, SyncStatus};
pub use error::{Result, SyncError};
pub use events::{ChangeBatch, ChangeKind, ConflictEvent, FailureNotice, RemoteEvent, SubscriptionId};
pub use hub::SubscriptionHub;
pub use queue::{Enqueued, FailOutcome, FailureClass, MutationQueue};
pub use source::memory::{MemoryBackend, Submission};
pub use source::{Committed, RemoteError, RemoteSource};
