//! Mutation queue: the durable, ordered log of local writes not yet
//! confirmed by the remote source.
//!
//! Every change is written through to the [`Store`] before it is applied in
//! memory, so the queue survives process restarts.
//!
//! ## Ordering
//!
//! Mutations for the same entity are submitted strictly in sequence order:
//! only the oldest queued mutation of an entity is ever eligible, and it stays
//! at the head until it is committed, failed terminally or dropped.
//!
//! ## Cancel-on-queue
//!
//! A DELETE enqueued while a CREATE for the same entity has never been handed
//! to the remote source cancels that CREATE and everything queued after it.
//! The DELETE itself is not stored: the entity never reaches the remote
//! source. A CREATE that was submitted at least once may have been applied
//! (a timeout leaves the outcome unknown), so the DELETE is queued after it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use replica_core::{
    now_millis, validate_draft, EntityKey, FailureRecord, Mutation, MutationDraft, MutationKind,
    MutationOp, MutationState, SeqNo, UserId, Version,
};
use replica_store::Store;

use crate::backoff::BackoffConfig;
use crate::cache::PendingView;
use crate::error::Result;
use crate::source::RemoteError;

/// How a failed submission is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// No connectivity: retried forever, the retry budget is untouched.
    Offline,
    /// Network hiccup or timeout: retried while the budget lasts.
    Transient,
    /// Permanent rejection: never retried.
    Rejected,
}

impl FailureClass {
    /// Classify a remote error. Conflicts are not failures and yield `None`.
    pub fn of(error: &RemoteError) -> Option<Self> {
        match error {
            RemoteError::Conflict { .. } => None,
            RemoteError::Offline => Some(FailureClass::Offline),
            RemoteError::Transient(_) | RemoteError::Timeout => Some(FailureClass::Transient),
            RemoteError::Rejected(_) => Some(FailureClass::Rejected),
        }
    }
}

/// Result of marking a mutation failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Back to pending; eligible again at `at`.
    Retry { at: Instant, attempts: u32 },
    /// Removed from the queue and recorded as a failure.
    Terminal(FailureRecord),
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub seq: SeqNo,
    /// Mutations cancelled by this one. When non-empty the new mutation was
    /// not stored.
    pub cancelled: Vec<SeqNo>,
}

#[derive(Debug, Clone)]
struct Entry {
    mutation: Mutation,
    /// Not eligible before this instant.
    retry_at: Option<Instant>,
    /// Backoff exponent. Grows on every failure, offline ones included.
    step: u32,
    /// Handed to the remote source at least once.
    submitted: bool,
}

/// The durable mutation queue of one user.
pub struct MutationQueue<S> {
    store: Arc<S>,
    user: UserId,
    entries: BTreeMap<SeqNo, Entry>,
    by_key: BTreeMap<EntityKey, BTreeSet<SeqNo>>,
    next_seq: SeqNo,
    max_retries: u32,
    backoff: BackoffConfig,
}

impl<S: Store> MutationQueue<S> {
    /// Load the user's queue from storage.
    ///
    /// Mutations that were in flight when the process stopped are reset to
    /// pending: their outcome is unknown and they will be resubmitted.
    pub async fn load(
        store: Arc<S>,
        user: UserId,
        max_retries: u32,
        backoff: BackoffConfig,
    ) -> Result<Self> {
        let next_seq = store.max_seq().await?.map_or(SeqNo(1), SeqNo::next);
        let mut queue = Self {
            store,
            user,
            entries: BTreeMap::new(),
            by_key: BTreeMap::new(),
            next_seq,
            max_retries,
            backoff,
        };

        for mut mutation in queue.store.load_mutations(&queue.user).await? {
            let submitted = mutation.state == MutationState::InFlight || mutation.attempts > 0;
            if mutation.state == MutationState::InFlight {
                mutation.state = MutationState::Pending;
                queue.store.update_mutation(&queue.user, &mutation).await?;
            }
            queue.insert(mutation, submitted);
        }

        debug!(user = %queue.user, queued = queue.len(), next_seq = %queue.next_seq, "mutation queue loaded");
        Ok(queue)
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    fn insert(&mut self, mutation: Mutation, submitted: bool) {
        self.by_key
            .entry(mutation.key.clone())
            .or_default()
            .insert(mutation.seq);
        self.entries.insert(
            mutation.seq,
            Entry {
                mutation,
                retry_at: None,
                step: 0,
                submitted,
            },
        );
    }

    fn take(&mut self, seq: SeqNo) -> Option<Entry> {
        let entry = self.entries.remove(&seq)?;
        if let Some(seqs) = self.by_key.get_mut(&entry.mutation.key) {
            seqs.remove(&seq);
            if seqs.is_empty() {
                self.by_key.remove(&entry.mutation.key);
            }
        }
        Some(entry)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enqueue
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a mutation based on the given remote version.
    ///
    /// Fails with a validation error if the draft is malformed (e.g. an UPDATE
    /// with an empty patch).
    pub async fn enqueue(
        &mut self,
        draft: MutationDraft,
        base_version: Option<Version>,
    ) -> Result<Enqueued> {
        validate_draft(&draft)?;

        let seq = self.next_seq;
        self.next_seq = seq.next();

        if matches!(draft.op, MutationOp::Delete) {
            let cancelled = self.cancellable_create(&draft.key);
            if !cancelled.is_empty() {
                for &victim in &cancelled {
                    self.store
                        .remove_mutation(&self.user, &draft.key.collection, victim)
                        .await?;
                    self.take(victim);
                }
                debug!(key = %draft.key, %seq, cancelled = cancelled.len(), "delete cancelled pending create");
                return Ok(Enqueued { seq, cancelled });
            }
        }

        let mutation = draft.into_mutation(seq, base_version, now_millis());
        self.store.append_mutation(&self.user, &mutation).await?;
        debug!(key = %mutation.key, %seq, kind = ?mutation.kind(), "mutation enqueued");
        self.insert(mutation, false);

        Ok(Enqueued {
            seq,
            cancelled: Vec::new(),
        })
    }

    /// The latest never-submitted CREATE of the key and everything queued
    /// after it.
    fn cancellable_create(&self, key: &EntityKey) -> Vec<SeqNo> {
        let Some(seqs) = self.by_key.get(key) else {
            return Vec::new();
        };
        let create = seqs.iter().rev().copied().find(|seq| {
            self.entries.get(seq).is_some_and(|e| {
                e.mutation.kind() == MutationKind::Create
                    && e.mutation.state == MutationState::Pending
                    && !e.submitted
            })
        });

        match create {
            Some(from) => seqs.range(from..).copied().collect(),
            None => Vec::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether a queued mutation can be submitted now.
    fn is_eligible(&self, seq: SeqNo, now: Instant) -> bool {
        let Some(entry) = self.entries.get(&seq) else {
            return false;
        };
        entry.mutation.state == MutationState::Pending
            && entry.retry_at.map_or(true, |at| at <= now)
            && self.head(&entry.mutation.key).map(|m| m.seq) == Some(seq)
    }

    /// Mutations that can be submitted now, oldest first.
    ///
    /// Only the head of each entity's queue is considered, so at most one
    /// mutation per entity is ever in flight.
    pub fn ready(&self, now: Instant) -> Vec<SeqNo> {
        let mut ready: Vec<SeqNo> = self
            .by_key
            .values()
            .filter_map(|seqs| seqs.first().copied())
            .filter(|&seq| self.is_eligible(seq, now))
            .collect();
        ready.sort();
        ready
    }

    /// The oldest mutation that can be submitted now.
    pub fn peek_next(&self, now: Instant) -> Option<&Mutation> {
        self.ready(now)
            .first()
            .and_then(|seq| self.entries.get(seq))
            .map(|e| &e.mutation)
    }

    /// Earliest instant at which a backed-off mutation becomes eligible.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.by_key
            .values()
            .filter_map(|seqs| seqs.first())
            .filter_map(|seq| self.entries.get(seq))
            .filter(|e| e.mutation.state == MutationState::Pending)
            .filter_map(|e| e.retry_at)
            .min()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle transitions
    // ─────────────────────────────────────────────────────────────────────────

    async fn set_state(&mut self, seq: SeqNo, state: MutationState) -> Result<Option<Mutation>> {
        let Some(entry) = self.entries.get_mut(&seq) else {
            return Ok(None);
        };
        entry.mutation.state = state;
        let mutation = entry.mutation.clone();
        self.store.update_mutation(&self.user, &mutation).await?;
        Ok(Some(mutation))
    }

    /// PENDING → IN_FLIGHT.
    pub async fn mark_in_flight(&mut self, seq: SeqNo) -> Result<Option<Mutation>> {
        if let Some(entry) = self.entries.get_mut(&seq) {
            entry.submitted = true;
        }
        self.set_state(seq, MutationState::InFlight).await
    }

    /// Retire a committed mutation. Idempotent.
    ///
    /// Later mutations of the same entity that were based on the same remote
    /// version are rebased onto `version`.
    pub async fn mark_committed(&mut self, seq: SeqNo, version: Version) -> Result<Option<Mutation>> {
        let Some(entry) = self.entries.get(&seq) else {
            return Ok(None);
        };
        let committed = entry.mutation.clone();

        self.store
            .remove_mutation(&self.user, &committed.key.collection, seq)
            .await?;
        self.take(seq);

        let later: Vec<SeqNo> = self
            .by_key
            .get(&committed.key)
            .map(|seqs| seqs.range(seq..).copied().collect())
            .unwrap_or_default();
        for later_seq in later {
            let Some(entry) = self.entries.get_mut(&later_seq) else {
                continue;
            };
            if entry.mutation.base_version == committed.base_version {
                entry.mutation.base_version = Some(version);
                let rebased = entry.mutation.clone();
                self.store.update_mutation(&self.user, &rebased).await?;
            }
        }

        debug!(key = %committed.key, %seq, %version, "mutation committed");
        Ok(Some(committed))
    }

    /// Record a failed submission.
    ///
    /// Returns `None` if the mutation is no longer queued.
    pub async fn mark_failed(
        &mut self,
        seq: SeqNo,
        class: FailureClass,
        reason: impl Into<String>,
    ) -> Result<Option<FailOutcome>> {
        let max_retries = self.max_retries;
        let Some(entry) = self.entries.get_mut(&seq) else {
            return Ok(None);
        };

        entry.step = entry.step.saturating_add(1);
        if class == FailureClass::Transient {
            entry.mutation.attempts = entry.mutation.attempts.saturating_add(1);
        }

        let terminal = match class {
            FailureClass::Offline => false,
            FailureClass::Transient => entry.mutation.attempts > max_retries,
            FailureClass::Rejected => true,
        };

        if terminal {
            let mut mutation = entry.mutation.clone();
            mutation.state = MutationState::Pending;
            let record = FailureRecord {
                mutation,
                reason: reason.into(),
                failed_at: now_millis(),
            };
            self.store.record_failure(&self.user, &record).await?;
            self.store
                .remove_mutation(&self.user, &record.mutation.key.collection, seq)
                .await?;
            self.take(seq);
            return Ok(Some(FailOutcome::Terminal(record)));
        }

        let at = Instant::now() + self.backoff.delay(entry.step);
        entry.retry_at = Some(at);
        entry.mutation.state = MutationState::Pending;
        let attempts = entry.mutation.attempts;
        let mutation = entry.mutation.clone();
        self.store.update_mutation(&self.user, &mutation).await?;

        Ok(Some(FailOutcome::Retry { at, attempts }))
    }

    /// Halt every queued mutation of the entity. Returns their sequence numbers.
    pub async fn mark_conflicted(&mut self, key: &EntityKey) -> Result<Vec<SeqNo>> {
        let seqs = self.seqs_for(key);
        for &seq in &seqs {
            self.set_state(seq, MutationState::Conflicted).await?;
        }
        Ok(seqs)
    }

    /// Drop every queued mutation of the entity.
    pub async fn drop_key(&mut self, key: &EntityKey) -> Result<Vec<Mutation>> {
        let mut dropped = Vec::new();
        for seq in self.seqs_for(key) {
            self.store
                .remove_mutation(&self.user, &key.collection, seq)
                .await?;
            if let Some(entry) = self.take(seq) {
                dropped.push(entry.mutation);
            }
        }
        Ok(dropped)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get(&self, seq: SeqNo) -> Option<&Mutation> {
        self.entries.get(&seq).map(|e| &e.mutation)
    }

    /// Oldest queued mutation of the entity.
    pub fn head(&self, key: &EntityKey) -> Option<&Mutation> {
        self.by_key
            .get(key)
            .and_then(|seqs| seqs.first())
            .and_then(|seq| self.get(*seq))
    }

    /// Sequence numbers of the entity's queued mutations, oldest first.
    pub fn seqs_for(&self, key: &EntityKey) -> Vec<SeqNo> {
        self.by_key
            .get(key)
            .map(|seqs| seqs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The entity's queued operations, oldest first, for the cache projection.
    pub fn view(&self, key: &EntityKey) -> PendingView<'_> {
        let mutations: Vec<&Mutation> = self
            .by_key
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|seq| self.get(*seq))
            .collect();
        PendingView {
            conflicted: mutations
                .iter()
                .any(|m| m.state == MutationState::Conflicted),
            ops: mutations.into_iter().map(|m| &m.op).collect(),
        }
    }

    pub fn is_conflicted(&self, key: &EntityKey) -> bool {
        self.head(key)
            .is_some_and(|m| m.state == MutationState::Conflicted)
    }

    pub fn has_in_flight(&self, key: &EntityKey) -> bool {
        self.head(key)
            .is_some_and(|m| m.state == MutationState::InFlight)
    }

    pub fn in_flight_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.mutation.state == MutationState::InFlight)
            .count()
    }

    /// Entities with unresolved conflicts.
    pub fn conflicted_keys(&self) -> Vec<EntityKey> {
        self.by_key
            .keys()
            .filter(|key| self.is_conflicted(key))
            .cloned()
            .collect()
    }

    /// Entities with at least one queued mutation.
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.by_key.keys()
    }

    /// All queued mutations in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &Mutation> {
        self.entries.values().map(|e| &e.mutation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
