//! Remote source abstraction.
//!
//! The remote source is the hosted database: it accepts mutations guarded by
//! an optimistic concurrency token and pushes snapshot changes in real time.
//! Its wire protocol is owned by the hosting service, so the core only sees
//! this narrow interface.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use replica_core::{CollectionName, Filter, Mutation, Snapshot, UserId, Version};

use crate::events::RemoteEvent;

/// A successful remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    /// Version of the entity after the write.
    pub version: Version,
}

/// Outcome classes of a failed remote operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    /// The expected version no longer matches (precondition failed).
    #[error("version mismatch")]
    Conflict { current: Option<Snapshot> },

    /// No connectivity. Retried without consuming the retry budget.
    #[error("remote source unreachable")]
    Offline,

    /// Network or server hiccup. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// No answer in time. Retried with backoff.
    #[error("remote operation timed out")]
    Timeout,

    /// Permanent rejection (permission denied, invalid document...).
    #[error("rejected: {0}")]
    Rejected(String),
}

/// The remote source adapter consumed by the sync engine.
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
    /// Submit one mutation. `expected` is the remote version the mutation was
    /// based on; the source must refuse the write if it no longer matches.
    async fn submit_mutation(
        &self,
        user: &UserId,
        mutation: &Mutation,
        expected: Option<Version>,
    ) -> Result<Committed, RemoteError>;

    /// Open a real-time snapshot stream over one collection.
    ///
    /// The stream starts with the current state of the collection and then
    /// delivers every change. It ends when the connection drops.
    async fn subscribe_snapshots(
        &self,
        user: &UserId,
        collection: &CollectionName,
        filter: Option<&Filter>,
    ) -> Result<mpsc::Receiver<RemoteEvent>, RemoteError>;
}

#[async_trait]
impl<R: RemoteSource + ?Sized> RemoteSource for Arc<R> {
    async fn submit_mutation(
        &self,
        user: &UserId,
        mutation: &Mutation,
        expected: Option<Version>,
    ) -> Result<Committed, RemoteError> {
        (**self).submit_mutation(user, mutation, expected).await
    }

    async fn subscribe_snapshots(
        &self,
        user: &UserId,
        collection: &CollectionName,
        filter: Option<&Filter>,
    ) -> Result<mpsc::Receiver<RemoteEvent>, RemoteError> {
        (**self).subscribe_snapshots(user, collection, filter).await
    }
}

/// An in-memory remote source for testing.
///
/// Models the hosted backend: version checks, real-time fan-out, an
/// online/offline switch, scripted failures, latency and writes from other
/// devices.
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Mutex;

    use replica_core::{
        apply_op, EntityId, EntityKey, Fields, MutationKind, MutationOp, SeqNo,
    };

    use crate::convergence::ProjectionDigest;
    use crate::events::ChangeKind;

    /// Capacity of each snapshot stream. A subscriber that falls this far
    /// behind is disconnected and has to resubscribe.
    const STREAM_CAPACITY: usize = 1024;

    type Namespace = (UserId, CollectionName);

    /// One recorded `submit_mutation` call.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Submission {
        pub user: UserId,
        pub seq: SeqNo,
        pub key: EntityKey,
        pub kind: MutationKind,
        pub expected: Option<Version>,
    }

    #[derive(Default)]
    struct BackendInner {
        online: bool,
        latency: Duration,
        records: HashMap<Namespace, BTreeMap<EntityId, Snapshot>>,
        subscribers: HashMap<Namespace, Vec<(Option<Filter>, mpsc::Sender<RemoteEvent>)>>,
        scripted: VecDeque<RemoteError>,
        submissions: Vec<Submission>,
    }

    impl BackendInner {
        fn namespace(user: &UserId, key: &EntityKey) -> Namespace {
            (user.clone(), key.collection.clone())
        }

        fn current(&self, user: &UserId, key: &EntityKey) -> Option<&Snapshot> {
            self.records
                .get(&Self::namespace(user, key))
                .and_then(|records| records.get(&key.id))
        }

        /// Store a new snapshot and push it to every subscriber.
        fn write(&mut self, user: &UserId, snapshot: Snapshot, kind: ChangeKind) {
            let ns = Self::namespace(user, &snapshot.key);
            self.records
                .entry(ns.clone())
                .or_default()
                .insert(snapshot.key.id.clone(), snapshot.clone());

            let Some(subscribers) = self.subscribers.get_mut(&ns) else {
                return;
            };
            let event = RemoteEvent { snapshot, kind };
            subscribers.retain(|(filter, tx)| {
                if !passes(filter.as_ref(), &event.snapshot) {
                    return !tx.is_closed();
                }
                match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(key = %event.snapshot.key, "snapshot subscriber lagging, disconnecting");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }

        fn apply(
            &mut self,
            user: &UserId,
            mutation: &Mutation,
            expected: Option<Version>,
        ) -> Result<Committed, RemoteError> {
            let current = self.current(user, &mutation.key).cloned();
            let live = current.as_ref().filter(|s| !s.is_tombstone());
            let next = current.as_ref().map_or(Version(1), |s| s.version.next());

            let kind = match (&mutation.op, live) {
                (MutationOp::Create { .. }, None) => ChangeKind::Added,
                (MutationOp::Create { .. }, Some(_)) => {
                    return Err(RemoteError::Conflict {
                        current: current.clone(),
                    });
                }
                (MutationOp::Update { .. }, Some(s)) if Some(s.version) == expected => {
                    ChangeKind::Modified
                }
                (MutationOp::Delete, Some(s)) if Some(s.version) == expected => {
                    ChangeKind::Removed
                }
                (MutationOp::Delete, None) => {
                    // Deleting a deleted entity is a no-op.
                    if let Some(tombstone) = &current {
                        return Ok(Committed {
                            version: tombstone.version,
                        });
                    }
                    ChangeKind::Removed
                }
                _ => {
                    return Err(RemoteError::Conflict {
                        current: current.clone(),
                    })
                }
            };

            let fields = apply_op(live.and_then(|s| s.fields.as_ref()), &mutation.op);
            let snapshot = Snapshot {
                key: mutation.key.clone(),
                fields,
                version: next,
            };
            self.write(user, snapshot, kind);
            Ok(Committed { version: next })
        }
    }

    fn passes(filter: Option<&Filter>, snapshot: &Snapshot) -> bool {
        match (filter, &snapshot.fields) {
            (Some(filter), Some(fields)) => filter.matches(fields),
            _ => true,
        }
    }

    /// In-memory backend implementation.
    pub struct MemoryBackend {
        inner: Mutex<BackendInner>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    /// Decrements the in-flight counter even if the submission is cancelled.
    struct InFlightGuard<'a>(&'a AtomicUsize);

    impl Drop for InFlightGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl MemoryBackend {
        /// Create an online backend with no data.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Go online or offline. Going offline drops every snapshot stream.
        pub async fn set_online(&self, online: bool) {
            let mut inner = self.inner.lock().await;
            inner.online = online;
            if !online {
                inner.subscribers.clear();
            }
        }

        pub async fn is_online(&self) -> bool {
            self.inner.lock().await.online
        }

        /// Delay applied to every submission.
        pub async fn set_latency(&self, latency: Duration) {
            self.inner.lock().await.latency = latency;
        }

        /// Fail the next submissions with the given errors, in order.
        pub async fn script_failures(&self, errors: impl IntoIterator<Item = RemoteError>) {
            self.inner.lock().await.scripted.extend(errors);
        }

        /// Write from another device. `None` deletes the entity.
        pub async fn write_external(
            &self,
            user: &UserId,
            key: &EntityKey,
            fields: Option<Fields>,
        ) -> Version {
            let mut inner = self.inner.lock().await;
            let current = inner.current(user, key);
            let existed = current.is_some_and(|s| !s.is_tombstone());
            let version = current.map_or(Version(1), |s| s.version.next());
            let kind = match (&fields, existed) {
                (None, _) => ChangeKind::Removed,
                (Some(_), true) => ChangeKind::Modified,
                (Some(_), false) => ChangeKind::Added,
            };
            let snapshot = Snapshot {
                key: key.clone(),
                fields,
                version,
            };
            inner.write(user, snapshot, kind);
            version
        }

        /// Current remote state of an entity, tombstones included.
        pub async fn get(&self, user: &UserId, key: &EntityKey) -> Option<Snapshot> {
            self.inner.lock().await.current(user, key).cloned()
        }

        /// Live entities of a collection, ordered by id.
        pub async fn snapshots(&self, user: &UserId, collection: &CollectionName) -> Vec<Snapshot> {
            let inner = self.inner.lock().await;
            inner
                .records
                .get(&(user.clone(), collection.clone()))
                .map(|records| {
                    records
                        .values()
                        .filter(|s| !s.is_tombstone())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        }

        /// Digest of a collection's live entities, comparable with the
        /// digest of a local projection.
        pub async fn digest(&self, user: &UserId, collection: &CollectionName) -> ProjectionDigest {
            let snapshots = self.snapshots(user, collection).await;
            ProjectionDigest::of_snapshots(collection, &snapshots)
        }

        /// Every submission seen so far, in arrival order.
        pub async fn submissions(&self) -> Vec<Submission> {
            self.inner.lock().await.submissions.clone()
        }

        /// Submissions currently being processed.
        pub fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }

        /// Highest number of concurrent submissions observed.
        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        /// Number of open snapshot streams over a collection.
        pub async fn subscriber_count(&self, user: &UserId, collection: &CollectionName) -> usize {
            let inner = self.inner.lock().await;
            inner
                .subscribers
                .get(&(user.clone(), collection.clone()))
                .map(|subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
                .unwrap_or(0)
        }
    }

    impl Default for MemoryBackend {
        fn default() -> Self {
            Self {
                inner: Mutex::new(BackendInner {
                    online: true,
                    ..BackendInner::default()
                }),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteSource for MemoryBackend {
        async fn submit_mutation(
            &self,
            user: &UserId,
            mutation: &Mutation,
            expected: Option<Version>,
        ) -> Result<Committed, RemoteError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlightGuard(&self.in_flight);

            let latency = {
                let mut inner = self.inner.lock().await;
                inner.submissions.push(Submission {
                    user: user.clone(),
                    seq: mutation.seq,
                    key: mutation.key.clone(),
                    kind: mutation.kind(),
                    expected,
                });
                if !inner.online {
                    return Err(RemoteError::Offline);
                }
                if let Some(error) = inner.scripted.pop_front() {
                    return Err(error);
                }
                inner.latency
            };

            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let mut inner = self.inner.lock().await;
            if !inner.online {
                return Err(RemoteError::Offline);
            }
            inner.apply(user, mutation, expected)
        }

        async fn subscribe_snapshots(
            &self,
            user: &UserId,
            collection: &CollectionName,
            filter: Option<&Filter>,
        ) -> Result<mpsc::Receiver<RemoteEvent>, RemoteError> {
            let mut inner = self.inner.lock().await;
            if !inner.online {
                return Err(RemoteError::Offline);
            }

            let ns = (user.clone(), collection.clone());
            let initial: Vec<RemoteEvent> = inner
                .records
                .get(&ns)
                .map(|records| {
                    records
                        .values()
                        .filter(|s| passes(filter, s))
                        .map(|s| match s.fields {
                            Some(_) => RemoteEvent::added(s.clone()),
                            None => RemoteEvent::removed(s.key.clone(), s.version),
                        })
                        .collect()
                })
                .unwrap_or_default();

            let (tx, rx) = mpsc::channel(STREAM_CAPACITY.max(initial.len() + 1));
            for event in initial {
                // Capacity covers the initial state.
                let _ = tx.try_send(event);
            }
            inner
                .subscribers
                .entry(ns)
                .or_default()
                .push((filter.cloned(), tx));
            Ok(rx)
        }
    }

}
