//! Proptest generators for property-based testing.

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::Value;

use replica_core::{
    apply_op, apply_patches, EntityKey, Fields, MutationDraft, MutationOp, Origin, Snapshot,
    UserId, Version,
};
use replica_store::MemoryStore;
use replica_sync::{BackoffConfig, EntityCache, FailureClass, MutationQueue};

/// Generate a field name from a small alphabet, so patches overlap.
pub fn field_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("title".to_string()),
        Just("body".to_string()),
        Just("done".to_string()),
        Just("rank".to_string()),
    ]
}

/// Generate a scalar JSON value.
pub fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        (-1000i64..1000).prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::String),
    ]
}

/// Generate a field map.
pub fn fields() -> impl Strategy<Value = Fields> {
    prop::collection::btree_map(field_name(), scalar(), 0..4)
}

/// Generate a non-empty patch. Some values are `null`, which removes the field.
pub fn patch() -> impl Strategy<Value = Fields> {
    let value = prop_oneof![4 => scalar(), 1 => Just(Value::Null)];
    prop::collection::btree_map(field_name(), value, 1..4)
}

/// Generate a mutation operation.
pub fn mutation_op() -> impl Strategy<Value = MutationOp> {
    prop_oneof![
        1 => fields().prop_map(|fields| MutationOp::Create { fields }),
        3 => patch().prop_map(|patch| MutationOp::Update { patch }),
        1 => Just(MutationOp::Delete),
    ]
}

/// One step of a sync workload over a single entity.
#[derive(Debug, Clone)]
pub enum Step {
    /// Queue a local mutation.
    Enqueue(MutationOp),
    /// The head mutation is submitted and accepted.
    Commit,
    /// The head mutation is submitted and fails.
    Fail(FailureClass),
    /// A snapshot from another device arrives. `None` is a remote delete.
    Remote(Option<Fields>),
}

/// Generate a workload step.
pub fn step() -> impl Strategy<Value = Step> {
    let class = prop_oneof![
        Just(FailureClass::Offline),
        Just(FailureClass::Transient),
        Just(FailureClass::Rejected),
    ];
    prop_oneof![
        4 => mutation_op().prop_map(Step::Enqueue),
        2 => Just(Step::Commit),
        1 => class.prop_map(Step::Fail),
        1 => prop::option::weighted(0.8, fields()).prop_map(Step::Remote),
    ]
}

/// Generate a workload.
pub fn workload(max_len: usize) -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(step(), 0..=max_len)
}

/// Where a workload diverged from the reference model.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub step: usize,
    pub expected: Option<Fields>,
    pub actual: Option<Fields>,
}

/// Drive a [`MutationQueue`] and an [`EntityCache`] through `steps` the way
/// the sync engine does, checking after every step that the visible value
/// equals the queued operations folded over the last remote state.
pub async fn check_projection(steps: &[Step]) -> Result<(), Divergence> {
    let key = EntityKey::new("notes", "n1");
    let store = Arc::new(MemoryStore::new());
    let backoff = BackoffConfig {
        jitter: 0.0,
        ..BackoffConfig::default()
    };
    let Ok(mut queue) = MutationQueue::load(store, UserId::new("prop"), 2, backoff).await else {
        return Err(Divergence { step: 0, expected: None, actual: None });
    };
    let mut cache = EntityCache::new();

    // The remote side as the reference model sees it.
    let mut remote: Option<Fields> = None;
    let mut version = Version(0);

    for (i, step) in steps.iter().enumerate() {
        match step {
            Step::Enqueue(op) => {
                let draft = MutationDraft {
                    key: key.clone(),
                    op: op.clone(),
                };
                let base = cache.remote_version(&key);
                if queue.enqueue(draft, base).await.is_ok() {
                    cache.apply_local_mutation(&key, &queue.view(&key));
                }
            }
            Step::Commit => {
                let Some(seq) = queue.head(&key).map(|m| m.seq) else {
                    continue;
                };
                let _ = queue.mark_in_flight(seq).await;
                version = version.next();
                if let Ok(Some(committed)) = queue.mark_committed(seq, version).await {
                    remote = apply_op(remote.as_ref(), &committed.op);
                    cache.commit(&key, &committed.op, version, &queue.view(&key));
                }
            }
            Step::Fail(class) => {
                let Some(seq) = queue.head(&key).map(|m| m.seq) else {
                    continue;
                };
                let _ = queue.mark_in_flight(seq).await;
                if queue.mark_failed(seq, *class, "scripted").await.is_ok() {
                    cache.recompute(&key, &queue.view(&key));
                }
            }
            Step::Remote(fields) => {
                version = version.next();
                remote = fields.clone();
                let snapshot = Snapshot {
                    key: key.clone(),
                    fields: fields.clone(),
                    version,
                };
                cache.apply_remote_snapshot(snapshot, &queue.view(&key));
            }
        }

        let view = queue.view(&key);
        let expected = apply_patches(remote.as_ref(), view.ops.iter().copied());
        let visible = cache.get(&key);
        let actual = visible.map(|e| e.fields.clone());
        let origin_ok = visible.map_or(true, |e| {
            (e.origin == Origin::Remote) == view.ops.is_empty()
        });
        if expected != actual || !origin_ok {
            return Err(Divergence {
                step: i,
                expected,
                actual,
            });
        }
    }
    Ok(())
}
