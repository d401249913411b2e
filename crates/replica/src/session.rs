//! Session lifecycle driven by authentication.
//!
//! Sign-in opens a [`Replica`] for the user, a change of user switches it
//! over (full flush and re-subscription), and sign-out tears it down. Queued
//! writes stay in storage and are replayed the next time that user signs in.

use std::sync::Arc;

use replica_core::UserId;
use replica_store::Store;
use replica_sync::RemoteSource;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{ReplicaError, Result};
use crate::replica::{Replica, ReplicaConfig};

/// The authentication adapter.
pub trait AuthSource: Send + Sync {
    /// The signed-in user, if any.
    fn current_user(&self) -> Option<UserId>;

    /// A receiver notified on every sign-in, sign-out or user change.
    fn changes(&self) -> watch::Receiver<Option<UserId>>;
}

/// In-memory authentication for testing.
///
/// Dropping it closes the change channel.
pub struct MemoryAuth {
    user: watch::Sender<Option<UserId>>,
}

impl MemoryAuth {
    /// Start signed out.
    pub fn new() -> Self {
        let (user, _) = watch::channel(None);
        Self { user }
    }

    pub fn sign_in(&self, user: UserId) {
        self.user.send_replace(Some(user));
    }

    pub fn sign_out(&self) {
        self.user.send_replace(None);
    }
}

impl Default for MemoryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSource for MemoryAuth {
    fn current_user(&self) -> Option<UserId> {
        self.user.borrow().clone()
    }

    fn changes(&self) -> watch::Receiver<Option<UserId>> {
        self.user.subscribe()
    }
}

/// Owns the [`Replica`] of whoever is signed in.
pub struct Session<S: Store + 'static, R: RemoteSource> {
    store: Arc<S>,
    remote: Arc<R>,
    config: ReplicaConfig,
    replica: Option<Replica<S, R>>,
}

impl<S: Store + 'static, R: RemoteSource> Session<S, R> {
    /// A signed-out session.
    pub fn new(store: Arc<S>, remote: Arc<R>, config: ReplicaConfig) -> Self {
        Self {
            store,
            remote,
            config,
            replica: None,
        }
    }

    /// The replica of the signed-in user.
    pub fn replica(&self) -> Option<&Replica<S, R>> {
        self.replica.as_ref()
    }

    /// The replica of the signed-in user, or [`ReplicaError::SignedOut`].
    pub fn current(&self) -> Result<&Replica<S, R>> {
        self.replica.as_ref().ok_or(ReplicaError::SignedOut)
    }

    pub fn is_signed_in(&self) -> bool {
        self.replica.is_some()
    }

    /// Bring the session in line with the authenticated user.
    pub async fn apply(&mut self, user: Option<UserId>) -> Result<()> {
        let Some(user) = user else {
            if let Some(replica) = self.replica.take() {
                info!(user = %replica.user(), "signed out");
                replica.shutdown().await?;
            }
            return Ok(());
        };

        if let Some(replica) = &self.replica {
            if replica.user() == user {
                debug!(%user, "user unchanged");
                return Ok(());
            }
            return replica.switch_user(user).await;
        }

        info!(%user, "signed in");
        let replica = Replica::open(
            user,
            self.store.clone(),
            self.remote.clone(),
            self.config.clone(),
        )
        .await?;
        self.replica = Some(replica);
        Ok(())
    }

    /// Apply auth changes until the channel closes, then tear down.
    pub async fn follow(&mut self, mut changes: watch::Receiver<Option<UserId>>) -> Result<()> {
        let user = changes.borrow_and_update().clone();
        self.apply(user).await?;

        while changes.changed().await.is_ok() {
            let user = changes.borrow_and_update().clone();
            self.apply(user).await?;
        }

        debug!("auth channel closed");
        self.apply(None).await
    }
}
