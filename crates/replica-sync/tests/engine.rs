//! End-to-end tests of the sync engine against the in-memory backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, Instant};

use replica_core::{
    CollectionName, Entity, EntityKey, Fields, MutationDraft, MutationKind, Origin, Query, UserId,
    ValidationError, Version,
};
use replica_store::MemoryStore;
use replica_sync::{
    BackoffConfig, ChangeBatch, MemoryBackend, RemoteError, SyncConfig,
    SyncEngine, SyncError, SyncHandle,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn alice() -> UserId {
    UserId::new("alice")
}

fn fast_config() -> SyncConfig {
    let backoff = BackoffConfig {
        base: Duration::from_millis(5),
        factor: 2.0,
        cap: Duration::from_millis(40),
        jitter: 0.0,
    };
    SyncConfig {
        submit_timeout: Duration::from_secs(2),
        backoff: backoff.clone(),
        listener_backoff: backoff,
        ..SyncConfig::default()
    }
}

async fn spawn(store: Arc<MemoryStore>, backend: Arc<MemoryBackend>, config: SyncConfig) -> SyncHandle {
    init_tracing();
    SyncEngine::spawn(alice(), store, backend, config).await.unwrap()
}

/// Poll until the condition holds, failing the test after five seconds.
macro_rules! eventually {
    ($cond:expr) => {{
        let deadline = Instant::now() + Duration::from_secs(5);
        while !$cond {
            assert!(Instant::now() < deadline, "not reached in time: {}", stringify!($cond));
            sleep(Duration::from_millis(5)).await;
        }
    }};
}

fn apply_batch(model: &mut BTreeMap<EntityKey, Entity>, batch: ChangeBatch) {
    for entity in batch.added.into_iter().chain(batch.updated) {
        model.insert(entity.key.clone(), entity);
    }
    for key in batch.removed {
        model.remove(&key);
    }
}

#[tokio::test]
async fn test_offline_update_commits_after_reconnect() {
    let backend = MemoryBackend::new();
    let handle = spawn(Arc::new(MemoryStore::new()), backend.clone(), fast_config()).await;
    let note = EntityKey::new("notes", "note1");

    backend
        .write_external(&alice(), &note, Some(fields(&[("title", json!("draft"))])))
        .await;
    handle.watch(CollectionName::new("notes")).unwrap();
    eventually!(handle.get(&note).is_some());

    backend.set_online(false).await;
    let seq = handle
        .enqueue(MutationDraft::update(note.clone(), fields(&[("title", json!("A"))])))
        .await
        .unwrap();

    let visible = handle.get(&note).unwrap();
    assert_eq!(visible.fields["title"], json!("A"));
    assert_eq!(visible.origin, Origin::LocalPending);

    eventually!(backend.submissions().await.len() >= 3);
    assert!(!handle.status().online);

    backend.set_online(true).await;
    handle.confirm(seq).await.unwrap();

    let committed = handle.get(&note).unwrap();
    assert_eq!(committed.fields["title"], json!("A"));
    assert_eq!(committed.origin, Origin::Remote);
    assert_eq!(committed.version, Some(Version(2)));
    handle.wait_for_status(|s| s.pending == 0 && s.online).await.unwrap();
}

#[tokio::test]
async fn test_version_conflict_halts_until_resolved() {
    let backend = MemoryBackend::new();
    let handle = spawn(Arc::new(MemoryStore::new()), backend.clone(), fast_config()).await;
    let task = EntityKey::new("tasks", "task1");

    for _ in 0..5 {
        backend
            .write_external(&alice(), &task, Some(fields(&[("done", json!(false))])))
            .await;
    }
    handle.watch(CollectionName::new("tasks")).unwrap();
    eventually!(handle.get(&task).and_then(|e| e.version) == Some(Version(5)));

    backend.set_latency(Duration::from_millis(200)).await;
    let seq = handle
        .enqueue(MutationDraft::update(task.clone(), fields(&[("done", json!(true))])))
        .await
        .unwrap();
    eventually!(backend.submissions().await.len() == 1);
    assert_eq!(backend.submissions().await[0].expected, Some(Version(5)));

    // Another device changes the task while the update is in flight.
    backend
        .write_external(
            &alice(),
            &task,
            Some(fields(&[("done", json!(false)), ("note", json!("other"))])),
        )
        .await;

    assert!(matches!(handle.confirm(seq).await, Err(SyncError::Conflict(_))));
    let conflicts = handle.conflicts();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.local.as_ref().unwrap()["done"], json!(true));
    assert_eq!(conflict.remote.as_ref().unwrap()["done"], json!(false));
    assert_eq!(conflict.remote_version, Some(Version(6)));
    assert_eq!(handle.get(&task).unwrap().origin, Origin::LocalConflicted);

    // No automatic retry.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.submissions().await.len(), 1);

    let blocked = handle
        .enqueue(MutationDraft::update(task.clone(), fields(&[("done", json!(false))])))
        .await;
    assert!(matches!(
        blocked,
        Err(SyncError::Validation(ValidationError::UnresolvedConflict(_)))
    ));

    let corrective = handle
        .resolve_conflict(
            task.clone(),
            Some(fields(&[("done", json!(true)), ("note", json!("other"))])),
        )
        .await
        .unwrap()
        .unwrap();
    handle.confirm(corrective).await.unwrap();

    let submissions = backend.submissions().await;
    let last = submissions.last().unwrap();
    assert_eq!(last.kind, MutationKind::Update);
    assert_eq!(last.expected, Some(Version(6)));

    let remote = backend.get(&alice(), &task).await.unwrap();
    assert_eq!(remote.version, Version(7));
    assert_eq!(remote.fields.unwrap()["done"], json!(true));
    assert!(handle.conflicts().is_empty());
}

#[tokio::test]
async fn test_in_flight_limit_respected() {
    let backend = MemoryBackend::new();
    backend.set_latency(Duration::from_millis(200)).await;
    let handle = spawn(Arc::new(MemoryStore::new()), backend.clone(), fast_config()).await;

    let mut seqs = Vec::new();
    for i in 0..5 {
        let draft = MutationDraft::create("notes", fields(&[("n", json!(i))]));
        seqs.push(handle.enqueue(draft).await.unwrap());
    }
    for seq in seqs {
        handle.confirm(seq).await.unwrap();
    }

    assert_eq!(backend.submissions().await.len(), 5);
    assert_eq!(backend.max_in_flight(), 4);
}

#[tokio::test]
async fn test_in_flight_limit_holds_across_user_switch() {
    let backend = MemoryBackend::new();
    backend.set_latency(Duration::from_millis(300)).await;
    let handle = spawn(Arc::new(MemoryStore::new()), backend.clone(), fast_config()).await;

    for i in 0..4 {
        let draft = MutationDraft::create("notes", fields(&[("owner", json!("alice")), ("n", json!(i))]));
        handle.enqueue(draft).await.unwrap();
    }
    eventually!(backend.in_flight() == 4);

    // Alice's submissions are still running when Bob's writes arrive.
    let bob = UserId::new("bob");
    handle.switch_user(bob.clone()).await.unwrap();
    let mut seqs = Vec::new();
    for i in 0..4 {
        let draft = MutationDraft::create("notes", fields(&[("owner", json!("bob")), ("n", json!(i))]));
        seqs.push(handle.enqueue(draft).await.unwrap());
    }
    sleep(Duration::from_millis(50)).await;
    assert!(backend.in_flight() <= 4, "in flight {}", backend.in_flight());

    for seq in seqs {
        handle.confirm(seq).await.unwrap();
    }
    assert_eq!(backend.max_in_flight(), 4);
    let submissions = backend.submissions().await;
    assert_eq!(submissions.iter().filter(|s| s.user == bob).count(), 4);
    assert_eq!(submissions.iter().filter(|s| s.user == alice()).count(), 4);
}

#[tokio::test]
async fn test_backed_off_queue_larger_than_limit_drains() {
    let backend = MemoryBackend::new();
    backend.set_online(false).await;
    let config = SyncConfig {
        in_flight_limit: 1,
        ..fast_config()
    };
    let handle = spawn(Arc::new(MemoryStore::new()), backend.clone(), config).await;

    let mut seqs = Vec::new();
    for i in 0..3 {
        let draft = MutationDraft::create("notes", fields(&[("n", json!(i))]));
        seqs.push(handle.enqueue(draft).await.unwrap());
    }
    eventually!(backend.submissions().await.len() >= 3);

    backend.set_latency(Duration::from_millis(100)).await;
    backend.set_online(true).await;
    for seq in seqs {
        handle.confirm(seq).await.unwrap();
    }
    assert_eq!(backend.max_in_flight(), 1);
    handle.wait_for_status(|s| s.pending == 0 && s.online).await.unwrap();
}

#[tokio::test]
async fn test_create_then_delete_never_reaches_remote() {
    let backend = MemoryBackend::new();
    let handle = spawn(Arc::new(MemoryStore::new()), backend.clone(), fast_config()).await;

    let create = MutationDraft::create("notes", fields(&[("title", json!("temp"))]));
    let key = create.key.clone();
    let delete = MutationDraft::delete(key.clone());

    // Both commands reach the engine in the same tick.
    let (created, deleted) = tokio::join!(handle.enqueue(create), handle.enqueue(delete));
    let created = created.unwrap();
    deleted.unwrap();

    handle.confirm(created).await.unwrap();
    assert!(handle.get(&key).is_none());

    sleep(Duration::from_millis(50)).await;
    assert!(backend.submissions().await.is_empty());
    assert_eq!(handle.status().pending, 0);
}

#[tokio::test]
async fn test_restart_replays_in_sequence_order() {
    let store = Arc::new(MemoryStore::new());

    let offline = MemoryBackend::new();
    offline.set_online(false).await;
    let first = spawn(store.clone(), offline, fast_config()).await;
    let a = MutationDraft::create("notes", fields(&[("title", json!("a"))]));
    let b = MutationDraft::create("notes", fields(&[("title", json!("b"))]));
    let a_key = a.key.clone();
    first.enqueue(a).await.unwrap();
    first.enqueue(b).await.unwrap();
    first
        .enqueue(MutationDraft::update(a_key.clone(), fields(&[("title", json!("a2"))])))
        .await
        .unwrap();
    first.shutdown().await.unwrap();

    let backend = MemoryBackend::new();
    let config = SyncConfig {
        in_flight_limit: 1,
        ..fast_config()
    };
    let second = spawn(store, backend.clone(), config).await;
    assert_eq!(second.get(&a_key).unwrap().fields["title"], json!("a2"));

    second.wait_caught_up().await.unwrap();
    let submissions = backend.submissions().await;
    let kinds: Vec<MutationKind> = submissions.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![MutationKind::Create, MutationKind::Create, MutationKind::Update]);
    assert!(submissions.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(submissions[2].expected, Some(Version(1)));
}

#[tokio::test]
async fn test_remote_delete_against_pending_update() {
    let backend = MemoryBackend::new();
    let handle = spawn(Arc::new(MemoryStore::new()), backend.clone(), fast_config()).await;
    let note = EntityKey::new("notes", "n1");

    backend
        .write_external(&alice(), &note, Some(fields(&[("title", json!("x"))])))
        .await;
    handle.watch(CollectionName::new("notes")).unwrap();
    eventually!(handle.get(&note).is_some());

    backend.set_online(false).await;
    handle
        .enqueue(MutationDraft::update(note.clone(), fields(&[("title", json!("mine"))])))
        .await
        .unwrap();
    backend.write_external(&alice(), &note, None).await;
    backend.set_online(true).await;

    eventually!(handle.conflicts().len() == 1);
    let conflict = handle.conflicts().remove(0);
    assert_eq!(conflict.remote, None);
    assert_eq!(conflict.remote_version, Some(Version(2)));

    let seq = handle
        .resolve_conflict(note.clone(), Some(fields(&[("title", json!("mine"))])))
        .await
        .unwrap()
        .unwrap();
    handle.confirm(seq).await.unwrap();

    let restored = backend.get(&alice(), &note).await.unwrap();
    assert_eq!(restored.version, Version(3));
    assert_eq!(restored.fields.unwrap()["title"], json!("mine"));
}

#[tokio::test]
async fn test_retry_budget_then_manual_retry() {
    let backend = MemoryBackend::new();
    let handle = spawn(Arc::new(MemoryStore::new()), backend.clone(), fast_config()).await;
    backend
        .script_failures((0..6).map(|i| RemoteError::Transient(format!("503 #{i}"))))
        .await;

    let draft = MutationDraft::create("notes", fields(&[("title", json!("t"))]));
    let key = draft.key.clone();
    let seq = handle.enqueue(draft).await.unwrap();

    assert!(matches!(handle.confirm(seq).await, Err(SyncError::Terminal { .. })));
    let failures = handle.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].mutation.attempts, 6);
    assert!(handle.get(&key).is_none());
    handle.wait_for_status(|s| s.failures == 1).await.unwrap();

    let retried = handle.retry_failure(seq).await.unwrap();
    assert!(retried > seq);
    handle.confirm(retried).await.unwrap();
    assert!(handle.failures().is_empty());
    assert_eq!(handle.get(&key).unwrap().origin, Origin::Remote);
    assert!(matches!(handle.retry_failure(seq).await, Err(SyncError::NoFailure(_))));
}

#[tokio::test]
async fn test_resubscribe_yields_same_projection() {
    let backend = MemoryBackend::new();
    let handle = spawn(Arc::new(MemoryStore::new()), backend.clone(), fast_config()).await;
    let query = Query::collection("notes");

    let (id, mut rx) = handle.subscribe(query.clone()).unwrap();
    let mut model = BTreeMap::new();
    for i in 0..3 {
        let seq = handle
            .enqueue(MutationDraft::create("notes", fields(&[("n", json!(i))])))
            .await
            .unwrap();
        handle.confirm(seq).await.unwrap();
    }
    backend
        .write_external(&alice(), &EntityKey::new("notes", "external"), Some(Fields::new()))
        .await;
    eventually!(handle.query(&query).len() == 4);

    // Drain what the first subscription received.
    eventually!({
        while let Ok(batch) = rx.try_recv() {
            apply_batch(&mut model, batch);
        }
        model.len() == 4 && model.values().all(|e| e.origin == Origin::Remote)
    });
    assert!(handle.unsubscribe(id));

    let (_, mut again) = handle.subscribe(query.clone()).unwrap();
    let mut fresh = BTreeMap::new();
    apply_batch(&mut fresh, again.recv().await.unwrap());
    assert_eq!(fresh, model);
}

#[tokio::test]
async fn test_switch_user_flushes_and_restores() {
    let backend = MemoryBackend::new();
    let handle = spawn(Arc::new(MemoryStore::new()), backend.clone(), fast_config()).await;

    let draft = MutationDraft::create("notes", fields(&[("owner", json!("alice"))]));
    let alice_note = draft.key.clone();
    let seq = handle.enqueue(draft).await.unwrap();
    handle.confirm(seq).await.unwrap();

    let (_, mut rx) = handle.subscribe(Query::collection("notes")).unwrap();
    assert_eq!(rx.recv().await.unwrap().added.len(), 1);

    handle.switch_user(UserId::new("bob")).await.unwrap();
    assert!(handle.get(&alice_note).is_none());
    assert_eq!(handle.status().user, UserId::new("bob"));
    let batch = rx.recv().await.unwrap();
    assert_eq!(batch.removed, vec![alice_note.clone()]);

    let bob_seq = handle
        .enqueue(MutationDraft::create("notes", fields(&[("owner", json!("bob"))])))
        .await
        .unwrap();
    handle.confirm(bob_seq).await.unwrap();
    assert!(bob_seq > seq);

    handle.switch_user(alice()).await.unwrap();
    assert_eq!(handle.get(&alice_note).unwrap().fields["owner"], json!("alice"));
    assert_eq!(handle.query(&Query::collection("notes")).len(), 1);
}

#[tokio::test]
async fn test_projection_converges_with_remote() {
    let backend = MemoryBackend::new();
    let handle = spawn(Arc::new(MemoryStore::new()), backend.clone(), fast_config()).await;
    let notes = CollectionName::new("notes");
    handle.watch(notes.clone()).unwrap();

    let mut seqs = Vec::new();
    for i in 0..4 {
        let draft = MutationDraft::create("notes", fields(&[("n", json!(i))]));
        seqs.push(handle.enqueue(draft).await.unwrap());
    }
    backend
        .write_external(&alice(), &EntityKey::new("notes", "remote"), Some(fields(&[("r", json!(true))])))
        .await;
    for seq in seqs {
        handle.confirm(seq).await.unwrap();
    }

    eventually!(handle.digest(&notes) == backend.digest(&alice(), &notes).await);
    assert_eq!(handle.query(&Query::collection("notes")).len(), 5);
}
