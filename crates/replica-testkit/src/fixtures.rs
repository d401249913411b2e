//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;
use std::time::Duration;

use replica_core::{EntityKey, Fields, UserId};
use replica_store::MemoryStore;
use replica_sync::{BackoffConfig, MemoryBackend, MutationQueue, SyncConfig, SyncEngine, SyncHandle};

/// Build a field map from pairs.
pub fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Backoff short enough for tests: 5ms doubling up to 40ms, no jitter.
pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        base: Duration::from_millis(5),
        factor: 2.0,
        cap: Duration::from_millis(40),
        jitter: 0.0,
    }
}

/// Sync configuration with the default limits and [`fast_backoff`].
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        submit_timeout: Duration::from_secs(2),
        backoff: fast_backoff(),
        listener_backoff: fast_backoff(),
        ..SyncConfig::default()
    }
}

/// A test fixture with a user, a memory store and a memory backend.
pub struct TestFixture {
    pub user: UserId,
    pub store: Arc<MemoryStore>,
    pub backend: Arc<MemoryBackend>,
}

impl TestFixture {
    /// Create a new fixture with a random user.
    pub fn new() -> Self {
        Self::with_user(format!("user-{:08x}", rand::random::<u32>()))
    }

    /// Create with a known user.
    pub fn with_user(user: impl Into<String>) -> Self {
        Self {
            user: UserId::new(user.into()),
            store: Arc::new(MemoryStore::new()),
            backend: MemoryBackend::new(),
        }
    }

    /// A key in `collection` with a fixed id.
    pub fn key(&self, collection: &str, id: &str) -> EntityKey {
        EntityKey::new(collection, id)
    }

    /// Start an engine for the fixture's user with [`fast_config`].
    pub async fn spawn(&self) -> replica_sync::Result<SyncHandle> {
        self.spawn_with(fast_config()).await
    }

    pub async fn spawn_with(&self, config: SyncConfig) -> replica_sync::Result<SyncHandle> {
        SyncEngine::spawn(
            self.user.clone(),
            self.store.clone(),
            self.backend.clone(),
            config,
        )
        .await
    }

    /// Load the fixture user's mutation queue directly.
    pub async fn queue(&self) -> replica_sync::Result<MutationQueue<MemoryStore>> {
        let config = fast_config();
        MutationQueue::load(
            self.store.clone(),
            self.user.clone(),
            config.max_retries,
            config.backoff,
        )
        .await
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixtures for several users sharing one store and one backend, as on a
/// shared device.
pub fn shared_device_fixtures(users: &[&str]) -> Vec<TestFixture> {
    let store = Arc::new(MemoryStore::new());
    let backend = MemoryBackend::new();
    users
        .iter()
        .map(|user| TestFixture {
            user: UserId::new(*user),
            store: store.clone(),
            backend: backend.clone(),
        })
        .collect()
}
