//! Presence store abstraction.
//!
//! The store holds two kinds of state per user: the membership set
//! (`user_servers:{user}`, an optimistic index of instances) and one
//! TTL-bearing marker per instance (`user_online:{user}:{instance}`, the
//! ground truth). It also carries the per-instance routing channels.
//!
//! Commands are independent; nothing here is transactional. Callers tolerate
//! membership without a marker and repair it lazily.

use std::time::Duration;

use {async_trait::async_trait, tracing::warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("presence store unavailable: {0}")]
    Unavailable(String),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Key/value + set + pub/sub substrate shared by all instances.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Add `instance_id` to the user's membership set. Idempotent.
    async fn add_member(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError>;

    async fn remove_member(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError>;

    async fn members(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    /// Create or overwrite the liveness marker with a fresh TTL.
    async fn set_marker(
        &self,
        user_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Reset the TTL of an existing marker. Returns `false` if it was absent.
    async fn refresh_marker(
        &self,
        user_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn delete_marker(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError>;

    async fn marker_exists(&self, user_id: &str, instance_id: &str) -> Result<bool, StoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError>;
}

/// A live subscription to one channel.
#[async_trait]
pub trait Subscription: Send {
    /// Next payload, or `None` once the underlying connection is gone.
    async fn next_payload(&mut self) -> Option<String>;

    async fn unsubscribe(self: Box<Self>) -> Result<(), StoreError>;
}

/// Claim presence for `user_id` on `instance_id`: membership first, then the
/// marker, so a reader never sees a marker without membership.
pub async fn announce(
    store: &dyn PresenceStore,
    user_id: &str,
    instance_id: &str,
    ttl: Duration,
) -> Result<(), StoreError> {
    store.add_member(user_id, instance_id).await?;
    store.set_marker(user_id, instance_id, ttl).await
}

/// Drop presence for `user_id` on `instance_id`: marker first, then
/// membership. Failures are logged and left for TTL expiry and the sender's
/// stale cleanup.
pub async fn withdraw(store: &dyn PresenceStore, user_id: &str, instance_id: &str) {
    if let Err(e) = store.delete_marker(user_id, instance_id).await {
        warn!(user_id, instance_id, error = %e, "failed to delete presence marker");
    }
    if let Err(e) = store.remove_member(user_id, instance_id).await {
        warn!(user_id, instance_id, error = %e, "failed to remove server membership");
    }
}
