//! Subscription hub: fan-out of cache changes to observers.
//!
//! Each subscription remembers the window it last delivered. On flush, every
//! subscription whose collection changed re-evaluates its query and receives
//! the minimal diff (`added`, `updated`, `removed`) against that window.
//!
//! Writers only mark collections dirty; nothing is delivered until the engine
//! flushes, so any number of cache changes between two flushes coalesce into
//! one batch per subscription.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use tokio::sync::mpsc;

use replica_core::{CollectionName, Entity, EntityKey, FailureRecord, Query, SeqNo};

use crate::cache::EntityCache;
use crate::events::{ChangeBatch, ConflictEvent, FailureNotice, SubscriptionId};

struct Subscription {
    query: Query,
    tx: mpsc::UnboundedSender<ChangeBatch>,
    /// The window as last delivered.
    window: Vec<Entity>,
}

/// Registry of active subscriptions plus the failures currently surfaced.
#[derive(Default)]
pub struct SubscriptionHub {
    next_id: u64,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    dirty: BTreeSet<CollectionName>,
    all_dirty: bool,
    /// Unresolved conflicts and undismissed terminal failures.
    outstanding: Vec<FailureNotice>,
    /// Notices surfaced since the last flush.
    fresh: Vec<FailureNotice>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer. The first batch carries the current window as
    /// `added`, plus the outstanding failures of the collection.
    pub fn subscribe(
        &mut self,
        query: Query,
        cache: &EntityCache,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ChangeBatch>) {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let (tx, rx) = mpsc::unbounded_channel();

        let window = cache.query(&query);
        let initial = ChangeBatch {
            subscription: id,
            added: window.clone(),
            updated: Vec::new(),
            removed: Vec::new(),
            order: window.iter().map(|e| e.key.clone()).collect(),
            failures: self
                .outstanding
                .iter()
                .filter(|n| n.key().collection == query.collection)
                .cloned()
                .collect(),
        };
        // The receiver is still in hand, so this cannot fail.
        let _ = tx.send(initial);

        tracing::debug!(subscription = id.0, collection = %query.collection, "observer attached");
        self.subscriptions.insert(id, Subscription { query, tx, window });
        (id, rx)
    }

    /// Detach an observer. Delivery stops immediately.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change tracking
    // ─────────────────────────────────────────────────────────────────────────

    pub fn mark_dirty(&mut self, collection: &CollectionName) {
        if !self.dirty.contains(collection) {
            self.dirty.insert(collection.clone());
        }
    }

    /// Every subscription is re-evaluated on the next flush.
    pub fn mark_all_dirty(&mut self) {
        self.all_dirty = true;
    }

    /// Surface a conflict or terminal failure to observers.
    pub fn surface(&mut self, notice: FailureNotice) {
        self.outstanding.retain(|n| !same_subject(n, &notice));
        self.outstanding.push(notice.clone());
        self.fresh.push(notice);
    }

    /// Replace every outstanding notice, e.g. after a user switch. All of
    /// them are delivered on the next flush.
    pub fn reset_outstanding(&mut self, notices: Vec<FailureNotice>) {
        self.fresh.extend(notices.iter().cloned());
        self.outstanding = notices;
    }

    pub fn retire_conflict(&mut self, key: &EntityKey) {
        self.outstanding
            .retain(|n| !matches!(n, FailureNotice::Conflict(c) if &c.key == key));
    }

    pub fn retire_failure(&mut self, seq: SeqNo) {
        self.outstanding
            .retain(|n| !matches!(n, FailureNotice::Terminal(r) if r.mutation.seq == seq));
    }

    pub fn conflicts(&self) -> Vec<ConflictEvent> {
        self.outstanding
            .iter()
            .filter_map(|n| match n {
                FailureNotice::Conflict(c) => Some(c.clone()),
                FailureNotice::Terminal(_) => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.outstanding
            .iter()
            .filter_map(|n| match n {
                FailureNotice::Terminal(r) => Some(r.clone()),
                FailureNotice::Conflict(_) => None,
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery
    // ─────────────────────────────────────────────────────────────────────────

    /// Deliver pending changes. Returns the number of batches sent.
    ///
    /// Subscriptions whose receiver was dropped are detached.
    pub fn flush(&mut self, cache: &EntityCache) -> usize {
        let dirty = mem::take(&mut self.dirty);
        let all_dirty = mem::take(&mut self.all_dirty);
        let fresh = mem::take(&mut self.fresh);
        if dirty.is_empty() && !all_dirty && fresh.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        self.subscriptions.retain(|id, sub| {
            if sub.tx.is_closed() {
                tracing::debug!(subscription = id.0, "observer dropped, detaching");
                return false;
            }

            let failures: Vec<FailureNotice> = fresh
                .iter()
                .filter(|n| n.key().collection == sub.query.collection)
                .cloned()
                .collect();
            let changed = all_dirty || dirty.contains(&sub.query.collection);
            if !changed && failures.is_empty() {
                return true;
            }

            let (mut batch, reordered) = if changed {
                let window = cache.query(&sub.query);
                let diffed = diff(&sub.window, &window);
                sub.window = window;
                diffed
            } else {
                let order = sub.window.iter().map(|e| e.key.clone()).collect();
                (ChangeBatch { order, ..ChangeBatch::default() }, false)
            };
            batch.subscription = *id;
            batch.failures = failures;

            if batch.is_empty() && !reordered {
                return true;
            }
            delivered += 1;
            sub.tx.send(batch).is_ok()
        });
        delivered
    }
}

fn same_subject(a: &FailureNotice, b: &FailureNotice) -> bool {
    match (a, b) {
        (FailureNotice::Conflict(x), FailureNotice::Conflict(y)) => x.key == y.key,
        (FailureNotice::Terminal(x), FailureNotice::Terminal(y)) => x.mutation.seq == y.mutation.seq,
        _ => false,
    }
}

/// Minimal diff between two windows, and whether the order of the window
/// changed.
fn diff(old: &[Entity], new: &[Entity]) -> (ChangeBatch, bool) {
    let before: BTreeMap<&EntityKey, &Entity> = old.iter().map(|e| (&e.key, e)).collect();
    let after: BTreeSet<&EntityKey> = new.iter().map(|e| &e.key).collect();

    let mut batch = ChangeBatch::default();
    for entity in new {
        match before.get(&entity.key) {
            None => batch.added.push(entity.clone()),
            Some(previous) if *previous != entity => batch.updated.push(entity.clone()),
            Some(_) => {}
        }
    }
    batch.removed = old
        .iter()
        .filter(|e| !after.contains(&e.key))
        .map(|e| e.key.clone())
        .collect();
    batch.order = new.iter().map(|e| e.key.clone()).collect();

    let reordered = !old.iter().map(|e| &e.key).eq(batch.order.iter());
    (batch, reordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PendingView;
    use replica_core::{Direction, Fields, Filter, Snapshot, Version};
    use serde_json::json;

    fn put(cache: &mut EntityCache, id: &str, rank: i64, version: u64) {
        let fields: Fields = [("rank".to_string(), json!(rank))].into_iter().collect();
        cache.apply_remote_snapshot(
            Snapshot::live(EntityKey::new("notes", id), fields, Version(version)),
            &PendingView::default(),
        );
    }

    fn notes() -> CollectionName {
        CollectionName::new("notes")
    }

    #[test]
    fn test_initial_batch_contains_window() {
        let mut cache = EntityCache::new();
        put(&mut cache, "a", 1, 1);
        put(&mut cache, "b", 2, 1);

        let mut hub = SubscriptionHub::new();
        let (_, mut rx) = hub.subscribe(Query::collection("notes"), &cache);
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.added.len(), 2);
        assert_eq!(batch.order.len(), 2);
    }

    #[test]
    fn test_changes_coalesce_into_one_batch() {
        let mut cache = EntityCache::new();
        let mut hub = SubscriptionHub::new();
        let (_, mut rx) = hub.subscribe(Query::collection("notes"), &cache);
        rx.try_recv().unwrap();

        for i in 0..50 {
            put(&mut cache, &format!("n{i:02}"), i, 1);
            hub.mark_dirty(&notes());
        }
        assert_eq!(hub.flush(&cache), 1);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.added.len(), 50);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_diff_added_updated_removed() {
        let mut cache = EntityCache::new();
        put(&mut cache, "a", 1, 1);
        put(&mut cache, "b", 2, 1);

        let mut hub = SubscriptionHub::new();
        let q = Query::collection("notes").filter(Filter::Lt("rank".into(), json!(10)));
        let (_, mut rx) = hub.subscribe(q, &cache);
        rx.try_recv().unwrap();

        put(&mut cache, "a", 5, 2); // updated
        put(&mut cache, "b", 50, 2); // leaves the filter
        put(&mut cache, "c", 3, 1); // added
        hub.mark_dirty(&notes());
        hub.flush(&cache);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.updated.len(), 1);
        assert_eq!(batch.removed, vec![EntityKey::new("notes", "b")]);
        assert_eq!(batch.added[0].key, EntityKey::new("notes", "c"));
    }

    #[test]
    fn test_other_collections_not_notified() {
        let mut cache = EntityCache::new();
        let mut hub = SubscriptionHub::new();
        let (_, mut rx) = hub.subscribe(Query::collection("notes"), &cache);
        rx.try_recv().unwrap();

        cache.apply_remote_snapshot(
            Snapshot::live(EntityKey::new("tasks", "t"), Fields::new(), Version(1)),
            &PendingView::default(),
        );
        hub.mark_dirty(&CollectionName::new("tasks"));
        assert_eq!(hub.flush(&cache), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reorder_is_reported() {
        let mut cache = EntityCache::new();
        put(&mut cache, "a", 1, 1);
        put(&mut cache, "b", 2, 1);

        let mut hub = SubscriptionHub::new();
        let q = Query::collection("notes").order_by("rank", Direction::Ascending);
        let (_, mut rx) = hub.subscribe(q, &cache);
        rx.try_recv().unwrap();

        put(&mut cache, "a", 3, 2);
        hub.mark_dirty(&notes());
        hub.flush(&cache);

        let batch = rx.try_recv().unwrap();
        assert_eq!(
            batch.order,
            vec![EntityKey::new("notes", "b"), EntityKey::new("notes", "a")]
        );
    }

    #[test]
    fn test_dropped_receiver_detached() {
        let cache = EntityCache::new();
        let mut hub = SubscriptionHub::new();
        let (_, rx) = hub.subscribe(Query::collection("notes"), &cache);
        drop(rx);

        hub.mark_dirty(&notes());
        hub.flush(&cache);
        assert!(hub.is_empty());
    }

    #[test]
    fn test_failures_reach_matching_subscriptions() {
        let cache = EntityCache::new();
        let mut hub = SubscriptionHub::new();
        let (_, mut rx) = hub.subscribe(Query::collection("notes"), &cache);
        rx.try_recv().unwrap();

        let conflict = ConflictEvent {
            key: EntityKey::new("notes", "n1"),
            local: None,
            remote: None,
            remote_version: Some(Version(2)),
            seqs: vec![SeqNo(1)],
        };
        hub.surface(FailureNotice::Conflict(conflict.clone()));
        hub.flush(&cache);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.failures, vec![FailureNotice::Conflict(conflict.clone())]);
        assert_eq!(hub.conflicts(), vec![conflict]);

        // A late subscriber still learns about it.
        let (_, mut late) = hub.subscribe(Query::collection("notes"), &cache);
        assert_eq!(late.try_recv().unwrap().failures.len(), 1);

        hub.retire_conflict(&EntityKey::new("notes", "n1"));
        assert!(hub.conflicts().is_empty());
    }
}
