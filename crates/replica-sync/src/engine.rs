//! The synchronization engine.
//!
//! One dedicated task owns the [`MutationQueue`] and is the only writer of the
//! [`EntityCache`]. Everything that changes state reaches it as a message:
//!
//! ```text
//!  SyncHandle ──commands──▶ ┌────────────┐ ──submit_mutation──▶ RemoteSource
//!                           │ SyncEngine │ ◀──── outcomes ─────
//!  listeners ──snapshots──▶ └────────────┘ ──change batches──▶ subscribers
//! ```
//!
//! After each wake-up the engine drains whatever else is already waiting,
//! starts eligible submissions, and flushes the subscription hub once. Many
//! changes arriving together therefore produce a single batch per subscriber.
//!
//! Reads (`get`, `query`, `subscribe`) go straight to the shared cache under a
//! read lock and never wait for the engine.

use std::collections::{BTreeSet, HashMap};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use replica_core::{
    diff_fields, validate_draft, CollectionName, Entity, EntityKey, FailureRecord, Fields,
    MutationDraft, MutationKind, MutationOp, MutationState, Query, SeqNo, Snapshot, UserId,
    ValidationError, Version,
};
use replica_store::Store;

use crate::backoff::BackoffConfig;
use crate::cache::EntityCache;
use crate::convergence::ProjectionDigest;
use crate::error::{Result, SyncError};
use crate::events::{ChangeBatch, ConflictEvent, FailureNotice, RemoteEvent, SubscriptionId};
use crate::hub::SubscriptionHub;
use crate::queue::{FailOutcome, FailureClass, MutationQueue};
use crate::source::{Committed, RemoteError, RemoteSource};

/// Messages handled per wake-up before the hub is flushed.
const DRAIN_LIMIT: usize = 256;

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum concurrent `submit_mutation` calls.
    pub in_flight_limit: usize,
    /// Transient failures tolerated before a mutation fails terminally.
    pub max_retries: u32,
    /// Deadline for one submission. Expiry counts as a transient failure.
    pub submit_timeout: Duration,
    /// Backoff between re-submissions.
    pub backoff: BackoffConfig,
    /// Backoff between snapshot stream reconnects.
    pub listener_backoff: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            in_flight_limit: 4,
            max_retries: 5,
            submit_timeout: Duration::from_secs(15),
            backoff: BackoffConfig::default(),
            listener_backoff: BackoffConfig::default(),
        }
    }
}

/// Observable state of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub user: UserId,
    /// False after a submission failed for lack of connectivity, until the
    /// remote source answers again.
    pub online: bool,
    /// Queued mutations, conflicted ones included.
    pub pending: usize,
    pub in_flight: usize,
    /// Unresolved conflicts.
    pub conflicts: usize,
    /// Terminal failures not yet retried or dismissed.
    pub failures: usize,
    /// Every mutation found in storage at start (or at the last user switch)
    /// has been committed or surfaced as a conflict or failure.
    pub caught_up: bool,
}

/// State shared between the engine task and its handles.
struct Shared {
    cache: RwLock<EntityCache>,
    hub: Mutex<SubscriptionHub>,
}

impl Shared {
    fn cache(&self) -> RwLockReadGuard<'_, EntityCache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_mut(&self) -> RwLockWriteGuard<'_, EntityCache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock order is hub, then cache.
    fn hub(&self) -> MutexGuard<'_, SubscriptionHub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Command {
    Enqueue {
        draft: MutationDraft,
        reply: oneshot::Sender<Result<SeqNo>>,
    },
    ResolveConflict {
        key: EntityKey,
        chosen: Option<Fields>,
        reply: oneshot::Sender<Result<Option<SeqNo>>>,
    },
    RetryFailure {
        seq: SeqNo,
        reply: oneshot::Sender<Result<SeqNo>>,
    },
    DismissFailure {
        seq: SeqNo,
        reply: oneshot::Sender<Result<()>>,
    },
    Confirm {
        seq: SeqNo,
        reply: oneshot::Sender<Result<()>>,
    },
    Watch {
        collection: CollectionName,
    },
    SwitchUser {
        user: UserId,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Messages produced by tasks the engine spawned. `generation` identifies the
/// session they belong to; anything from before a user switch is stale.
enum Internal {
    Submitted {
        user: UserId,
        generation: u64,
        seq: SeqNo,
        key: EntityKey,
        result: std::result::Result<Committed, RemoteError>,
    },
    Remote {
        generation: u64,
        event: RemoteEvent,
    },
}

/// Receiving ends of the engine's two inboxes.
type Inboxes = (
    mpsc::UnboundedReceiver<Command>,
    mpsc::UnboundedReceiver<Internal>,
);

/// The engine task. Created with [`SyncEngine::spawn`] and driven through
/// the returned [`SyncHandle`].
pub struct SyncEngine<S: Store + 'static, R: RemoteSource> {
    config: SyncConfig,
    store: Arc<S>,
    remote: Arc<R>,
    user: UserId,
    generation: u64,
    queue: MutationQueue<S>,
    shared: Arc<Shared>,
    internal: mpsc::UnboundedSender<Internal>,
    watched: BTreeSet<CollectionName>,
    listeners: HashMap<CollectionName, JoinHandle<()>>,
    /// `submit_mutation` calls not answered yet, previous sessions included.
    outstanding: usize,
    /// Mutations loaded from storage that have not settled yet.
    replay: BTreeSet<SeqNo>,
    waiters: HashMap<SeqNo, Vec<oneshot::Sender<Result<()>>>>,
    online: bool,
    status: watch::Sender<SyncStatus>,
}

impl<S: Store + 'static, R: RemoteSource> SyncEngine<S, R> {
    /// Load the user's state from `store` and start the engine task.
    ///
    /// Mutations found in storage are resubmitted in sequence order right
    /// away. The engine stops when every handle has been dropped or
    /// [`SyncHandle::shutdown`] is called.
    pub async fn spawn(
        user: UserId,
        store: Arc<S>,
        remote: Arc<R>,
        config: SyncConfig,
    ) -> Result<SyncHandle> {
        let (engine, handle, (commands, internal)) = Self::new(user, store, remote, config).await?;
        tokio::spawn(engine.run(commands, internal));
        Ok(handle)
    }

    async fn new(
        user: UserId,
        store: Arc<S>,
        remote: Arc<R>,
        config: SyncConfig,
    ) -> Result<(Self, SyncHandle, Inboxes)> {
        let session = Session::load(&store, &user, &config).await?;
        let replay = session.replay();

        let mut hub = SubscriptionHub::new();
        hub.reset_outstanding(session.notices.clone());
        let shared = Arc::new(Shared {
            cache: RwLock::new(session.cache),
            hub: Mutex::new(hub),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let status = SyncStatus {
            user: user.clone(),
            online: true,
            pending: session.queue.len(),
            in_flight: 0,
            conflicts: session.queue.conflicted_keys().len(),
            failures: session.failures,
            caught_up: replay.is_empty(),
        };
        let (status_tx, status_rx) = watch::channel(status);

        info!(%user, queued = session.queue.len(), replay = replay.len(), "sync engine starting");

        let engine = Self {
            config,
            store,
            remote,
            user,
            generation: 0,
            queue: session.queue,
            shared: shared.clone(),
            internal: internal_tx,
            watched: BTreeSet::new(),
            listeners: HashMap::new(),
            outstanding: 0,
            replay,
            waiters: HashMap::new(),
            online: true,
            status: status_tx,
        };
        let handle = SyncHandle {
            commands: command_tx,
            shared,
            status: status_rx,
        };
        Ok((engine, handle, (command_rx, internal_rx)))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        self.tick().await;

        loop {
            let deadline = self.retry_deadline();
            let retry = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let mut flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => ControlFlow::Break(()),
                },
                Some(message) = internal.recv() => {
                    self.handle_internal(message).await;
                    ControlFlow::Continue(())
                }
                _ = retry => ControlFlow::Continue(()),
            };

            // Coalesce whatever else is already waiting into this tick.
            let mut budget = DRAIN_LIMIT;
            while flow.is_continue() && budget > 0 {
                budget -= 1;
                if let Ok(message) = internal.try_recv() {
                    self.handle_internal(message).await;
                    continue;
                }
                match commands.try_recv() {
                    Ok(command) => flow = self.handle_command(command).await,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => flow = ControlFlow::Break(()),
                }
            }

            if flow.is_break() {
                break;
            }
            self.tick().await;
        }

        self.stop();
    }

    /// When the retry timer should fire. While every submission slot is taken
    /// nothing could start, so the engine waits for an outcome instead.
    fn retry_deadline(&self) -> Option<Instant> {
        if self.outstanding >= self.config.in_flight_limit {
            return None;
        }
        self.queue.next_retry_at()
    }

    /// Start eligible submissions, then publish the tick's changes.
    async fn tick(&mut self) {
        if let Err(error) = self.dispatch().await {
            warn!(%error, "failed to start submissions");
        }
        self.flush();
        self.publish_status();
    }

    fn flush(&self) {
        let mut hub = self.shared.hub();
        let cache = self.shared.cache();
        let delivered = hub.flush(&cache);
        if delivered > 0 {
            debug!(batches = delivered, "change batches delivered");
        }
    }

    fn publish_status(&self) {
        let (conflicts, failures) = {
            let hub = self.shared.hub();
            (hub.conflicts().len(), hub.failures().len())
        };
        let status = SyncStatus {
            user: self.user.clone(),
            online: self.online,
            pending: self.queue.len(),
            in_flight: self.queue.in_flight_count(),
            conflicts,
            failures,
            caught_up: self.replay.is_empty(),
        };
        self.status.send_if_modified(move |current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn stop(&mut self) {
        for (_, listener) in self.listeners.drain() {
            listener.abort();
        }
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(SyncError::EngineStopped));
            }
        }
        info!(user = %self.user, "sync engine stopped");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Enqueue { draft, reply } => {
                let result = self.enqueue(draft).await;
                self.publish_status();
                let _ = reply.send(result);
            }
            Command::ResolveConflict { key, chosen, reply } => {
                let result = self.resolve_conflict(key, chosen).await;
                self.publish_status();
                let _ = reply.send(result);
            }
            Command::RetryFailure { seq, reply } => {
                let result = self.retry_failure(seq).await;
                self.publish_status();
                let _ = reply.send(result);
            }
            Command::DismissFailure { seq, reply } => {
                let result = self.dismiss_failure(seq).await;
                self.publish_status();
                let _ = reply.send(result);
            }
            Command::Confirm { seq, reply } => self.confirm(seq, reply),
            Command::Watch { collection } => self.watch(collection),
            Command::SwitchUser { user, reply } => {
                let result = self.switch_user(user).await;
                self.publish_status();
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                self.stop();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn enqueue(&mut self, draft: MutationDraft) -> Result<SeqNo> {
        validate_draft(&draft)?;
        let key = draft.key.clone();
        if self.queue.is_conflicted(&key) {
            return Err(ValidationError::UnresolvedConflict(key).into());
        }

        let (visible, base) = {
            let cache = self.shared.cache();
            (cache.get(&key).is_some(), cache.remote_version(&key))
        };
        match (&draft.op, visible) {
            (MutationOp::Create { .. }, true) => {
                return Err(ValidationError::AlreadyExists(key).into());
            }
            (MutationOp::Update { .. } | MutationOp::Delete, false) => {
                return Err(ValidationError::UnknownEntity(key).into());
            }
            _ => {}
        }

        let enqueued = self.queue.enqueue(draft, base).await?;
        self.shared
            .cache_mut()
            .apply_local_mutation(&key, &self.queue.view(&key));
        self.persist(&key).await?;

        for &cancelled in &enqueued.cancelled {
            self.replay.remove(&cancelled);
            self.settle(cancelled, || Ok(()));
        }
        Ok(enqueued.seq)
    }

    async fn resolve_conflict(
        &mut self,
        key: EntityKey,
        chosen: Option<Fields>,
    ) -> Result<Option<SeqNo>> {
        if !self.queue.is_conflicted(&key) {
            return Err(SyncError::NoConflict(key));
        }

        let dropped = self.queue.drop_key(&key).await?;
        self.shared.hub().retire_conflict(&key);
        self.shared
            .cache_mut()
            .recompute(&key, &self.queue.view(&key));
        self.persist(&key).await?;

        let remote = self
            .shared
            .cache()
            .shadow(&key)
            .and_then(|s| s.fields.clone());
        let corrective = match (chosen, remote) {
            (Some(chosen), Some(remote)) => {
                let patch = diff_fields(&remote, &chosen);
                (!patch.is_empty()).then(|| MutationDraft::update(key.clone(), patch))
            }
            (Some(chosen), None) => Some(MutationDraft::create_with_id(key.clone(), chosen)),
            (None, Some(_)) => Some(MutationDraft::delete(key.clone())),
            (None, None) => None,
        };

        info!(
            %key,
            dropped = dropped.len(),
            corrective = ?corrective.as_ref().map(|d| d.op.kind()),
            "conflict resolved"
        );
        match corrective {
            Some(draft) => self.enqueue(draft).await.map(Some),
            None => Ok(None),
        }
    }

    async fn retry_failure(&mut self, seq: SeqNo) -> Result<SeqNo> {
        let Some(record) = self.store.take_failure(&self.user, seq).await? else {
            return Err(SyncError::NoFailure(seq));
        };

        match self.enqueue(record.mutation.to_draft()).await {
            Ok(retried) => {
                self.shared.hub().retire_failure(seq);
                info!(%seq, %retried, key = %record.mutation.key, "failed mutation re-enqueued");
                Ok(retried)
            }
            Err(error) => {
                self.store.record_failure(&self.user, &record).await?;
                Err(error)
            }
        }
    }

    async fn dismiss_failure(&mut self, seq: SeqNo) -> Result<()> {
        if self.store.take_failure(&self.user, seq).await?.is_none() {
            return Err(SyncError::NoFailure(seq));
        }
        self.shared.hub().retire_failure(seq);
        debug!(%seq, "failure dismissed");
        Ok(())
    }

    fn confirm(&mut self, seq: SeqNo, reply: oneshot::Sender<Result<()>>) {
        if let Some(mutation) = self.queue.get(seq) {
            if mutation.state == MutationState::Conflicted {
                let _ = reply.send(Err(SyncError::Conflict(mutation.key.clone())));
            } else {
                self.waiters.entry(seq).or_default().push(reply);
            }
            return;
        }

        let failed = self
            .shared
            .hub()
            .failures()
            .into_iter()
            .find(|record| record.mutation.seq == seq);
        let _ = reply.send(match failed {
            Some(record) => Err(SyncError::Terminal {
                seq,
                reason: record.reason,
            }),
            None => Ok(()),
        });
    }

    fn settle(&mut self, seq: SeqNo, outcome: impl Fn() -> Result<()>) {
        if let Some(waiters) = self.waiters.remove(&seq) {
            for waiter in waiters {
                let _ = waiter.send(outcome());
            }
        }
    }

    async fn switch_user(&mut self, user: UserId) -> Result<()> {
        if user == self.user {
            return Ok(());
        }
        let session = Session::load(&self.store, &user, &self.config).await?;

        info!(from = %self.user, to = %user, "switching user");
        for (_, listener) in self.listeners.drain() {
            listener.abort();
        }
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(SyncError::SessionChanged));
            }
        }

        self.generation += 1;
        self.user = user;
        self.replay = session.replay();
        self.queue = session.queue;
        *self.shared.cache_mut() = session.cache;
        {
            let mut hub = self.shared.hub();
            hub.reset_outstanding(session.notices);
            hub.mark_all_dirty();
        }

        for collection in self.watched.clone() {
            self.start_listener(collection);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Remote side
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_internal(&mut self, message: Internal) {
        let result = match message {
            Internal::Submitted {
                user,
                generation,
                seq,
                key,
                result,
            } => {
                self.outstanding = self.outstanding.saturating_sub(1);
                if generation == self.generation {
                    self.on_submitted(seq, result).await
                } else {
                    self.on_stale_submission(user, seq, key, result).await
                }
            }
            Internal::Remote { generation, event } => {
                if generation == self.generation {
                    self.on_remote(event).await
                } else {
                    Ok(())
                }
            }
        };
        if let Err(error) = result {
            warn!(%error, "failed to apply sync event");
        }
    }

    /// Start submissions until the in-flight limit is reached. Submissions
    /// still running for a previous user hold their slots.
    async fn dispatch(&mut self) -> Result<()> {
        let capacity = self.config.in_flight_limit.saturating_sub(self.outstanding);
        if capacity == 0 {
            return Ok(());
        }

        for seq in self.queue.ready(Instant::now()).into_iter().take(capacity) {
            let Some(mutation) = self.queue.mark_in_flight(seq).await? else {
                continue;
            };
            debug!(%seq, key = %mutation.key, attempt = mutation.attempts + 1, "submitting mutation");

            let remote = self.remote.clone();
            let tx = self.internal.clone();
            let user = self.user.clone();
            let generation = self.generation;
            let limit = self.config.submit_timeout;
            self.outstanding += 1;
            tokio::spawn(async move {
                let submit = remote.submit_mutation(&user, &mutation, mutation.base_version);
                let result = match tokio::time::timeout(limit, submit).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout),
                };
                let _ = tx.send(Internal::Submitted {
                    user,
                    generation,
                    seq,
                    key: mutation.key,
                    result,
                });
            });
        }
        Ok(())
    }

    async fn on_submitted(
        &mut self,
        seq: SeqNo,
        result: std::result::Result<Committed, RemoteError>,
    ) -> Result<()> {
        match result {
            Ok(committed) => self.on_committed(seq, committed.version).await,
            Err(RemoteError::Conflict { current }) => self.on_conflict(seq, current).await,
            Err(error) => self.on_failed(seq, error).await,
        }
    }

    /// A submission of a previous session finished. Only durable cleanup is
    /// done; the in-memory state belongs to the current user.
    async fn on_stale_submission(
        &mut self,
        user: UserId,
        seq: SeqNo,
        key: EntityKey,
        result: std::result::Result<Committed, RemoteError>,
    ) -> Result<()> {
        if result.is_ok() {
            self.store.remove_mutation(&user, &key.collection, seq).await?;
            debug!(%user, %seq, "committed mutation of previous session");
        }
        Ok(())
    }

    async fn on_committed(&mut self, seq: SeqNo, version: Version) -> Result<()> {
        self.online = true;
        let Some(mutation) = self.queue.mark_committed(seq, version).await? else {
            return Ok(());
        };
        let key = mutation.key.clone();
        self.shared
            .cache_mut()
            .commit(&key, &mutation.op, version, &self.queue.view(&key));
        self.persist(&key).await?;

        self.replay.remove(&seq);
        self.settle(seq, || Ok(()));
        Ok(())
    }

    async fn on_conflict(&mut self, seq: SeqNo, current: Option<Snapshot>) -> Result<()> {
        self.online = true;
        let Some(key) = self.queue.get(seq).map(|m| m.key.clone()) else {
            return Ok(());
        };
        let local = self.shared.cache().get(&key).map(|e| e.fields.clone());
        if let Some(snapshot) = current.filter(|s| s.key == key) {
            self.shared
                .cache_mut()
                .apply_remote_snapshot(snapshot, &self.queue.view(&key));
        }
        self.raise_conflict(&key, local).await
    }

    /// Halt every queued mutation of the entity and surface the divergence.
    async fn raise_conflict(&mut self, key: &EntityKey, local: Option<Fields>) -> Result<()> {
        let seqs = self.queue.mark_conflicted(key).await?;
        self.shared
            .cache_mut()
            .recompute(key, &self.queue.view(key));
        self.persist(key).await?;

        let (remote, remote_version) = {
            let cache = self.shared.cache();
            let shadow = cache.shadow(key);
            (
                shadow.and_then(|s| s.fields.clone()),
                shadow.map(|s| s.version),
            )
        };
        warn!(%key, ?remote_version, halted = seqs.len(), "conflict detected");

        self.shared.hub().surface(FailureNotice::Conflict(ConflictEvent {
            key: key.clone(),
            local,
            remote,
            remote_version,
            seqs: seqs.clone(),
        }));
        for seq in seqs {
            self.replay.remove(&seq);
            self.settle(seq, || Err(SyncError::Conflict(key.clone())));
        }
        Ok(())
    }

    async fn on_failed(&mut self, seq: SeqNo, error: RemoteError) -> Result<()> {
        let Some(class) = FailureClass::of(&error) else {
            return Ok(());
        };
        self.online = class != FailureClass::Offline;

        let Some(outcome) = self.queue.mark_failed(seq, class, error.to_string()).await? else {
            return Ok(());
        };
        match outcome {
            FailOutcome::Retry { at, attempts } => {
                debug!(
                    %seq,
                    attempt = attempts,
                    retry_in = ?at.saturating_duration_since(Instant::now()),
                    %error,
                    "submission failed, will retry"
                );
            }
            FailOutcome::Terminal(record) => {
                let key = record.mutation.key.clone();
                warn!(%seq, %key, reason = %record.reason, "mutation failed terminally");
                self.shared
                    .cache_mut()
                    .recompute(&key, &self.queue.view(&key));
                self.persist(&key).await?;

                self.replay.remove(&seq);
                let reason = record.reason.clone();
                self.settle(seq, || Err(SyncError::Terminal { seq, reason: reason.clone() }));
                self.shared.hub().surface(FailureNotice::Terminal(record));
            }
        }
        Ok(())
    }

    async fn on_remote(&mut self, event: RemoteEvent) -> Result<()> {
        self.online = true;
        let snapshot = event.snapshot;
        let key = snapshot.key.clone();
        let tombstone = snapshot.is_tombstone();

        let local = self.shared.cache().get(&key).map(|e| e.fields.clone());
        let applied = self
            .shared
            .cache_mut()
            .apply_remote_snapshot(snapshot, &self.queue.view(&key));
        if !applied {
            return Ok(());
        }

        // A remote delete under a pending update is a conflict, not data loss.
        let pending_update = self.queue.head(&key).is_some_and(|m| {
            m.kind() == MutationKind::Update && m.state == MutationState::Pending
        });
        if tombstone && pending_update {
            return self.raise_conflict(&key, local).await;
        }
        self.persist(&key).await
    }

    /// Write the entity's shadow through to storage and mark its collection
    /// for the next flush.
    async fn persist(&self, key: &EntityKey) -> Result<()> {
        let record = self.shared.cache().persisted(key);
        match record {
            Some(record) => self.store.put_entity(&self.user, &record).await?,
            None => self.store.remove_entity(&self.user, key).await?,
        }
        self.shared.hub().mark_dirty(&key.collection);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Listeners
    // ─────────────────────────────────────────────────────────────────────────

    fn watch(&mut self, collection: CollectionName) {
        if self.watched.insert(collection.clone()) {
            debug!(%collection, "watching collection");
        }
        self.start_listener(collection);
    }

    fn start_listener(&mut self, collection: CollectionName) {
        if self
            .listeners
            .get(&collection)
            .is_some_and(|listener| !listener.is_finished())
        {
            return;
        }
        let listener = tokio::spawn(listen(
            self.remote.clone(),
            self.user.clone(),
            collection.clone(),
            self.generation,
            self.internal.clone(),
            self.config.listener_backoff.clone(),
        ));
        self.listeners.insert(collection, listener);
    }
}

/// Forward one collection's snapshot stream to the engine, reconnecting with
/// backoff whenever the stream ends or cannot be opened.
async fn listen<R: RemoteSource>(
    remote: Arc<R>,
    user: UserId,
    collection: CollectionName,
    generation: u64,
    tx: mpsc::UnboundedSender<Internal>,
    backoff: BackoffConfig,
) {
    let mut attempt = 0u32;
    loop {
        match remote.subscribe_snapshots(&user, &collection, None).await {
            Ok(mut events) => {
                debug!(%collection, "snapshot stream open");
                attempt = 0;
                while let Some(event) = events.recv().await {
                    if tx.send(Internal::Remote { generation, event }).is_err() {
                        return;
                    }
                }
                debug!(%collection, "snapshot stream ended");
            }
            Err(error) => debug!(%collection, %error, "snapshot subscription failed"),
        }

        attempt = attempt.saturating_add(1);
        tokio::time::sleep(backoff.delay(attempt)).await;
        if tx.is_closed() {
            return;
        }
    }
}

/// Everything loaded from storage for one user.
struct Session<S> {
    queue: MutationQueue<S>,
    cache: EntityCache,
    notices: Vec<FailureNotice>,
    failures: usize,
}

impl<S: Store> Session<S> {
    async fn load(store: &Arc<S>, user: &UserId, config: &SyncConfig) -> Result<Self> {
        let queue = MutationQueue::load(
            store.clone(),
            user.clone(),
            config.max_retries,
            config.backoff.clone(),
        )
        .await?;

        let mut cache = EntityCache::load(store.load_entities(user).await?);
        for key in queue.keys() {
            cache.recompute(key, &queue.view(key));
        }

        let mut notices: Vec<FailureNotice> = queue
            .conflicted_keys()
            .into_iter()
            .map(|key| FailureNotice::Conflict(conflict_event(&queue, &cache, key)))
            .collect();
        let failures: Vec<FailureRecord> = store.list_failures(user).await?;
        let failure_count = failures.len();
        notices.extend(failures.into_iter().map(FailureNotice::Terminal));

        Ok(Self {
            queue,
            cache,
            notices,
            failures: failure_count,
        })
    }

    /// Queued mutations that still have to settle. Conflicted ones already
    /// have.
    fn replay(&self) -> BTreeSet<SeqNo> {
        self.queue
            .iter()
            .filter(|m| m.state != MutationState::Conflicted)
            .map(|m| m.seq)
            .collect()
    }
}

/// Rebuild the notice of a conflict found in storage.
fn conflict_event<S: Store>(queue: &MutationQueue<S>, cache: &EntityCache, key: EntityKey) -> ConflictEvent {
    let shadow = cache.shadow(&key);
    ConflictEvent {
        local: cache.get(&key).map(|e| e.fields.clone()),
        remote: shadow.and_then(|s| s.fields.clone()),
        remote_version: shadow.map(|s| s.version),
        seqs: queue.seqs_for(&key),
        key,
    }
}

/// Cloneable front door to a running [`SyncEngine`].
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    status: watch::Receiver<SyncStatus>,
}

impl SyncHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| SyncError::EngineStopped)?;
        response.await.map_err(|_| SyncError::EngineStopped)?
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue a mutation. It is visible to `get`, `query` and subscribers as
    /// soon as this returns.
    pub async fn enqueue(&self, draft: MutationDraft) -> Result<SeqNo> {
        self.request(|reply| Command::Enqueue { draft, reply }).await
    }

    /// Settle a conflict with the value the user chose (`None` deletes the
    /// entity). Returns the corrective mutation, if one was needed.
    pub async fn resolve_conflict(
        &self,
        key: EntityKey,
        chosen: Option<Fields>,
    ) -> Result<Option<SeqNo>> {
        self.request(|reply| Command::ResolveConflict { key, chosen, reply })
            .await
    }

    /// Re-enqueue a terminally failed mutation under a new sequence number.
    pub async fn retry_failure(&self, seq: SeqNo) -> Result<SeqNo> {
        self.request(|reply| Command::RetryFailure { seq, reply }).await
    }

    /// Forget a terminal failure.
    pub async fn dismiss_failure(&self, seq: SeqNo) -> Result<()> {
        self.request(|reply| Command::DismissFailure { seq, reply })
            .await
    }

    /// Wait until a mutation leaves the queue.
    ///
    /// Resolves `Ok` once it is committed (or was cancelled by a later
    /// delete), and with [`SyncError::Conflict`] or [`SyncError::Terminal`]
    /// if it was halted or failed instead.
    pub async fn confirm(&self, seq: SeqNo) -> Result<()> {
        self.request(|reply| Command::Confirm { seq, reply }).await
    }

    /// Tear down the current session and load `user`'s state. Subscribers
    /// stay attached and receive the difference.
    pub async fn switch_user(&self, user: UserId) -> Result<()> {
        self.request(|reply| Command::SwitchUser { user, reply })
            .await
    }

    /// Stop the engine. Listeners are aborted; submissions already sent are
    /// not awaited.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply })
            .map_err(|_| SyncError::EngineStopped)?;
        done.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Keep a collection in sync with the remote source.
    pub fn watch(&self, collection: CollectionName) -> Result<()> {
        self.commands
            .send(Command::Watch { collection })
            .map_err(|_| SyncError::EngineStopped)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get(&self, key: &EntityKey) -> Option<Entity> {
        self.shared.cache().get(key).cloned()
    }

    pub fn query(&self, query: &Query) -> Vec<Entity> {
        self.shared.cache().query(query)
    }

    /// Attach an observer. The first batch holds the current window; the
    /// collection is watched from now on.
    pub fn subscribe(
        &self,
        query: Query,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<ChangeBatch>)> {
        if self.commands.is_closed() {
            return Err(SyncError::EngineStopped);
        }
        let collection = query.collection.clone();
        let subscription = {
            let mut hub = self.shared.hub();
            let cache = self.shared.cache();
            hub.subscribe(query, &cache)
        };
        self.watch(collection)?;
        Ok(subscription)
    }

    /// Detach an observer. Returns false if it was not attached.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.hub().unsubscribe(id)
    }

    pub fn conflicts(&self) -> Vec<ConflictEvent> {
        self.shared.hub().conflicts()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.shared.hub().failures()
    }

    /// Digest of the visible entities of a collection.
    pub fn digest(&self, collection: &CollectionName) -> ProjectionDigest {
        let cache = self.shared.cache();
        ProjectionDigest::of_entities(collection, cache.entities(collection))
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for_status(
        &self,
        mut predicate: impl FnMut(&SyncStatus) -> bool,
    ) -> Result<SyncStatus> {
        let mut status = self.status.clone();
        let matched = status
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        Ok(SyncStatus::clone(&matched))
    }

    /// Wait until every mutation replayed from storage has settled.
    pub async fn wait_caught_up(&self) -> Result<()> {
        self.wait_for_status(|s| s.caught_up).await.map(|_| ())
    }
}
