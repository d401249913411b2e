//! Durability tests: state written by one store handle survives reopening.

use replica_core::{
    EntityKey, FailureRecord, Fields, MutationDraft, MutationKind, Origin, SeqNo, Snapshot,
    UserId, Version,
};
use replica_store::{MemoryStore, PersistedEntity, SqliteStore, Store};
use serde_json::json;

fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

async fn populate(store: &dyn Store, user: &UserId) {
    let create = MutationDraft::create_with_id(
        EntityKey::new("notes", "a"),
        fields(&[("title", json!("draft"))]),
    )
    .into_mutation(SeqNo(1), None, 1_000);
    let update = MutationDraft::update(
        EntityKey::new("notes", "b"),
        fields(&[("done", json!(true))]),
    )
    .into_mutation(SeqNo(2), Some(Version(4)), 2_000);
    let delete = MutationDraft::delete(EntityKey::new("tasks", "c"))
        .into_mutation(SeqNo(3), Some(Version(1)), 3_000);

    // Appended out of order on purpose: replay must follow sequence numbers.
    store.append_mutation(user, &delete).await.unwrap();
    store.append_mutation(user, &create).await.unwrap();
    store.append_mutation(user, &update).await.unwrap();

    store
        .put_entity(
            user,
            &PersistedEntity {
                snapshot: Snapshot::live(
                    EntityKey::new("notes", "b"),
                    fields(&[("done", json!(false))]),
                    Version(4),
                ),
                origin: Origin::LocalPending,
            },
        )
        .await
        .unwrap();

    let failed = MutationDraft::delete(EntityKey::new("notes", "z"))
        .into_mutation(SeqNo(4), Some(Version(2)), 4_000);
    store
        .record_failure(
            user,
            &FailureRecord {
                mutation: failed,
                reason: "rejected".into(),
                failed_at: 5_000,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let user = UserId::new("alice");

    {
        let store = SqliteStore::open(&path).unwrap();
        populate(&store, &user).await;
    }

    let store = SqliteStore::open(&path).unwrap();

    let queued = store.load_mutations(&user).await.unwrap();
    let seqs: Vec<_> = queued.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![SeqNo(1), SeqNo(2), SeqNo(3)]);
    assert_eq!(queued[0].kind(), MutationKind::Create);
    assert_eq!(queued[2].key, EntityKey::new("tasks", "c"));

    let entities = store.load_entities(&user).await.unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].snapshot.version, Version(4));

    assert_eq!(store.list_failures(&user).await.unwrap().len(), 1);
    assert_eq!(store.max_seq().await.unwrap(), Some(SeqNo(4)));
}

#[tokio::test]
async fn test_memory_and_sqlite_agree() {
    let user = UserId::new("alice");
    let memory = MemoryStore::new();
    let sqlite = SqliteStore::open_memory().unwrap();

    populate(&memory, &user).await;
    populate(&sqlite, &user).await;

    assert_eq!(
        memory.load_mutations(&user).await.unwrap(),
        sqlite.load_mutations(&user).await.unwrap()
    );
    assert_eq!(
        memory.load_entities(&user).await.unwrap(),
        sqlite.load_entities(&user).await.unwrap()
    );
    assert_eq!(
        memory.list_failures(&user).await.unwrap(),
        sqlite.list_failures(&user).await.unwrap()
    );
    assert_eq!(memory.max_seq().await.unwrap(), sqlite.max_seq().await.unwrap());
}

#[tokio::test]
async fn test_other_user_sees_nothing() {
    let store = SqliteStore::open_memory().unwrap();
    populate(&store, &UserId::new("alice")).await;

    let bob = UserId::new("bob");
    assert!(store.load_mutations(&bob).await.unwrap().is_empty());
    assert!(store.load_entities(&bob).await.unwrap().is_empty());
    assert!(store.list_failures(&bob).await.unwrap().is_empty());
    // Sequence numbers are device-wide.
    assert_eq!(store.max_seq().await.unwrap(), Some(SeqNo(4)));
}
