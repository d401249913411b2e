//! End-to-end scenarios through the unified API.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Instant};

use replica::store::{MemoryStore, SqliteStore};
use replica::sync::{FailureNotice, MemoryBackend, RemoteError};
use replica::{
    AuthSource, ChangeBatch, CollectionName, Direction, EntityKey, Filter, MemoryAuth,
    MemoryMediaStore, Origin, Query, Replica, ReplicaConfig, ReplicaError, Session, UserId,
    Version,
};
use replica_testkit::{fast_config, fields, TestFixture};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config() -> ReplicaConfig {
    ReplicaConfig {
        sync: fast_config(),
        collections: vec![CollectionName::new("notes")],
    }
}

async fn open(fixture: &TestFixture) -> Replica<MemoryStore, MemoryBackend> {
    init_tracing();
    Replica::open(
        fixture.user.clone(),
        fixture.store.clone(),
        fixture.backend.clone(),
        config(),
    )
    .await
    .unwrap()
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

/// Receive batches until one satisfies `predicate`.
async fn next_batch_where(
    batches: &mut UnboundedReceiver<ChangeBatch>,
    predicate: impl Fn(&ChangeBatch) -> bool,
) -> ChangeBatch {
    timeout(Duration::from_secs(5), async {
        loop {
            let batch = batches.recv().await.expect("subscription closed");
            if predicate(&batch) {
                return batch;
            }
        }
    })
    .await
    .expect("no matching batch in time")
}

#[tokio::test]
async fn test_offline_edits_survive_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let backend = MemoryBackend::new();
    let alice = UserId::new("alice");
    backend.set_online(false).await;

    let (first, second) = {
        let replica = Replica::open(
            alice.clone(),
            Arc::new(SqliteStore::open(&path).unwrap()),
            backend.clone(),
            config(),
        )
        .await
        .unwrap();

        let first = replica
            .create("notes", fields(&[("title", json!("groceries")), ("rank", json!(2))]))
            .await
            .unwrap();
        replica
            .update(first.clone(), fields(&[("title", json!("shopping"))]))
            .await
            .unwrap();
        let second = replica
            .create("notes", fields(&[("title", json!("chores")), ("rank", json!(1))]))
            .await
            .unwrap();
        assert_eq!(replica.status().pending, 3);
        replica.shutdown().await.unwrap();
        (first, second)
    };

    // Back online in a new process.
    backend.set_online(true).await;
    let replica = Replica::open(
        alice.clone(),
        Arc::new(SqliteStore::open(&path).unwrap()),
        backend.clone(),
        config(),
    )
    .await
    .unwrap();

    let restored = replica.get(&first).unwrap();
    assert_eq!(restored.fields["title"], json!("shopping"));
    assert_eq!(restored.origin, Origin::LocalPending);

    replica.wait_caught_up().await.unwrap();
    replica.wait_idle().await.unwrap();

    let remote = backend.get(&alice, &first).await.unwrap();
    assert_eq!(remote.fields.unwrap()["title"], json!("shopping"));
    assert_eq!(remote.version, Version(2));
    assert!(backend.get(&alice, &second).await.is_some());

    let ranked = replica.query(&Query::collection("notes").order_by("rank", Direction::Ascending));
    let keys: Vec<EntityKey> = ranked.into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec![second, first]);
    assert_eq!(
        replica.digest(&CollectionName::new("notes")),
        backend.digest(&alice, &CollectionName::new("notes")).await
    );
}

#[tokio::test]
async fn test_rejected_write_surfaces_in_batch_and_retries() {
    let fixture = TestFixture::with_user("alice");
    let replica = open(&fixture).await;
    let (_id, mut batches) = replica.subscribe(Query::collection("notes")).unwrap();
    let initial = batches.recv().await.unwrap();
    assert!(initial.added.is_empty());

    fixture
        .backend
        .script_failures([RemoteError::Rejected("permission denied".into())])
        .await;
    let key = replica
        .create("notes", fields(&[("title", json!("secret"))]))
        .await
        .unwrap();

    let batch = next_batch_where(&mut batches, |b| !b.failures.is_empty()).await;
    let FailureNotice::Terminal(record) = &batch.failures[0] else {
        panic!("expected a terminal failure, got {:?}", batch.failures[0]);
    };
    assert_eq!(record.mutation.key, key);
    assert_eq!(record.reason, "rejected: permission denied");
    assert!(replica.get(&key).is_none());
    assert_eq!(replica.failures().len(), 1);

    let retried = replica.retry_failure(record.mutation.seq).await.unwrap();
    assert!(retried > record.mutation.seq);
    replica.confirm(retried).await.unwrap();
    assert!(replica.failures().is_empty());

    let batch = next_batch_where(&mut batches, |b| b.order.contains(&key)).await;
    assert!(batch.failures.is_empty());
    assert_eq!(replica.get(&key).unwrap().origin, Origin::Remote);
}

#[tokio::test]
async fn test_conflict_resolved_by_delete() {
    let fixture = TestFixture::with_user("alice");
    let replica = open(&fixture).await;
    let key = EntityKey::new("notes", "shared");

    fixture
        .backend
        .write_external(&fixture.user, &key, Some(fields(&[("title", json!("v1"))])))
        .await;
    eventually!(replica.get(&key).is_some());

    fixture.backend.set_latency(Duration::from_millis(150)).await;
    let seq = replica
        .update(key.clone(), fields(&[("title", json!("mine"))]))
        .await
        .unwrap();
    eventually!(fixture.backend.in_flight() == 1);
    fixture
        .backend
        .write_external(&fixture.user, &key, Some(fields(&[("title", json!("theirs"))])))
        .await;

    let err = replica.confirm(seq).await.unwrap_err();
    assert!(matches!(err, ReplicaError::Sync(_)));
    let conflicts = replica.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].remote.as_ref().unwrap()["title"], json!("theirs"));
    assert_eq!(replica.status().conflicts, 1);

    let corrective = replica
        .resolve_conflict(key.clone(), None)
        .await
        .unwrap()
        .unwrap();
    assert!(replica.get(&key).is_none());
    replica.confirm(corrective).await.unwrap();

    assert!(fixture.backend.get(&fixture.user, &key).await.unwrap().is_tombstone());
    assert!(replica.conflicts().is_empty());
}

#[tokio::test]
async fn test_filtered_subscription_follows_remote_changes() {
    let fixture = TestFixture::with_user("alice");
    let replica = open(&fixture).await;
    let query = Query::collection("notes")
        .filter(Filter::Eq("done".into(), json!(false)))
        .order_by("title", Direction::Ascending);
    let (id, mut batches) = replica.subscribe(query).unwrap();
    batches.recv().await.unwrap();

    let a = EntityKey::new("notes", "a");
    fixture
        .backend
        .write_external(
            &fixture.user,
            &a,
            Some(fields(&[("title", json!("water plants")), ("done", json!(false))])),
        )
        .await;
    let batch = next_batch_where(&mut batches, |b| !b.added.is_empty()).await;
    assert_eq!(batch.added[0].key, a);

    // Completing the task moves it out of the window.
    replica
        .update(a.clone(), fields(&[("done", json!(true))]))
        .await
        .unwrap();
    let batch = next_batch_where(&mut batches, |b| !b.removed.is_empty()).await;
    assert_eq!(batch.removed, vec![a.clone()]);
    assert!(batch.order.is_empty());

    assert!(replica.unsubscribe(id));
    assert!(!replica.unsubscribe(id));
}

#[tokio::test]
async fn test_session_follows_auth() {
    init_tracing();
    let fixture = TestFixture::with_user("alice");
    let notes = CollectionName::new("notes");
    let alice = UserId::new("alice");
    let bob = UserId::new("bob");

    let auth = MemoryAuth::new();
    let mut session = Session::new(fixture.store.clone(), fixture.backend.clone(), config());
    let changes = auth.changes();
    let follower = tokio::spawn(async move {
        let result = session.follow(changes).await;
        (session, result)
    });

    auth.sign_in(alice.clone());
    eventually!(fixture.backend.subscriber_count(&alice, &notes).await == 1);

    auth.sign_in(bob.clone());
    eventually!(fixture.backend.subscriber_count(&bob, &notes).await == 1);
    eventually!(fixture.backend.subscriber_count(&alice, &notes).await == 0);

    auth.sign_out();
    eventually!(fixture.backend.subscriber_count(&bob, &notes).await == 0);
    assert_eq!(auth.current_user(), None);

    drop(auth);
    let (session, result) = follower.await.unwrap();
    result.unwrap();
    assert!(!session.is_signed_in());
    assert!(matches!(session.current(), Err(ReplicaError::SignedOut)));
}

#[tokio::test]
async fn test_user_switch_keeps_data_apart() {
    let fixture = TestFixture::with_user("alice");
    let replica = open(&fixture).await;
    let (_id, mut batches) = replica.subscribe(Query::collection("notes")).unwrap();
    batches.recv().await.unwrap();

    let key = replica
        .create("notes", fields(&[("title", json!("alice's"))]))
        .await
        .unwrap();
    replica.wait_idle().await.unwrap();

    replica.switch_user(UserId::new("bob")).await.unwrap();
    assert_eq!(replica.user(), UserId::new("bob"));
    assert!(replica.get(&key).is_none());
    let batch = next_batch_where(&mut batches, |b| !b.removed.is_empty()).await;
    assert_eq!(batch.removed, vec![key.clone()]);

    replica.switch_user(fixture.user.clone()).await.unwrap();
    let batch = next_batch_where(&mut batches, |b| !b.added.is_empty()).await;
    assert_eq!(batch.added[0].key, key);
}

#[tokio::test]
async fn test_media_url_reaches_remote() {
    let fixture = TestFixture::with_user("alice");
    let replica = open(&fixture).await;
    let media = MemoryMediaStore::new("https://cdn.example");

    let key = replica
        .create("notes", fields(&[("title", json!("trip"))]))
        .await
        .unwrap();
    let url = replica
        .attach_media(&media, key.clone(), "photo", "alice/trip.jpg", Bytes::from_static(b"jpeg"))
        .await
        .unwrap();
    replica.wait_idle().await.unwrap();

    let remote = fixture.backend.get(&fixture.user, &key).await.unwrap();
    assert_eq!(remote.fields.unwrap()["photo"], json!(url));
    assert_eq!(media.get("alice/trip.jpg").unwrap(), Bytes::from_static(b"jpeg"));
}
