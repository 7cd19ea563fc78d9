//! In-process [`PresenceStore`] for tests and local development.
//!
//! Marker expiry is evaluated lazily against `tokio::time::Instant`, so a
//! paused test clock drives TTLs. Every publish is kept for inspection and
//! never trimmed, which rules it out for long-running deployments. Fault
//! injection covers whole-store outages, per-channel publish failures and
//! holding a heartbeat refresh mid-flight.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::{
        sync::{Notify, mpsc},
        time::Instant,
    },
};

use switchboard_protocol::keys;

use crate::presence::{PresenceStore, StoreError, Subscription};

#[derive(Default)]
struct Inner {
    sets: HashMap<String, HashSet<String>>,
    /// marker key → expiry
    markers: HashMap<String, Instant>,
    /// channel → (subscription id, sender)
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>,
    next_subscription: u64,
    /// Every successful publish, in order.
    published: Vec<(String, String)>,
    failing_channels: HashSet<String>,
}

impl Inner {
    fn live_marker(&mut self, key: &str) -> bool {
        match self.markers.get(key) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                self.markers.remove(key);
                false
            },
            None => false,
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Parks one `refresh_marker` call before it touches the marker.
#[derive(Default)]
pub struct RefreshGate {
    /// Signalled once the refresh is parked.
    pub entered: Notify,
    /// Notify to let the refresh continue.
    pub release: Notify,
}

#[derive(Default)]
pub struct MemoryPresenceStore {
    inner: Arc<Mutex<Inner>>,
    unavailable: AtomicBool,
    refresh_gate: Mutex<Option<Arc<RefreshGate>>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make publishes to `channel` fail.
    pub fn fail_publish_to(&self, channel: &str) {
        lock(&self.inner).failing_channels.insert(channel.to_string());
    }

    /// Park the next `refresh_marker` call until the returned gate is released.
    pub fn hold_next_refresh(&self) -> Arc<RefreshGate> {
        let gate = Arc::new(RefreshGate::default());
        *self.refresh_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&gate));
        gate
    }

    /// `(channel, payload)` for every successful publish so far.
    pub fn published(&self) -> Vec<(String, String)> {
        lock(&self.inner).published.clone()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.inner)
            .subscribers
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
    }

    /// Remaining lifetime of a marker, `None` if absent or expired.
    pub fn marker_ttl(&self, user_id: &str, instance_id: &str) -> Option<Duration> {
        let key = keys::user_online(user_id, instance_id);
        let mut inner = lock(&self.inner);
        if !inner.live_marker(&key) {
            return None;
        }
        inner
            .markers
            .get(&key)
            .map(|expiry| expiry.saturating_duration_since(Instant::now()))
    }

    pub fn is_member(&self, user_id: &str, instance_id: &str) -> bool {
        lock(&self.inner)
            .sets
            .get(&keys::user_servers(user_id))
            .is_some_and(|set| set.contains(instance_id))
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn add_member(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.inner)
            .sets
            .entry(keys::user_servers(user_id))
            .or_default()
            .insert(instance_id.to_string());
        Ok(())
    }

    async fn remove_member(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError> {
        self.check()?;
        let key = keys::user_servers(user_id);
        let mut inner = lock(&self.inner);
        if let Some(set) = inner.sets.get_mut(&key) {
            set.remove(instance_id);
            // Redis drops empty sets.
            if set.is_empty() {
                inner.sets.remove(&key);
            }
        }
        Ok(())
    }

    async fn members(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let mut members: Vec<String> = lock(&self.inner)
            .sets
            .get(&keys::user_servers(user_id))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn set_marker(
        &self,
        user_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.inner)
            .markers
            .insert(keys::user_online(user_id, instance_id), Instant::now() + ttl);
        Ok(())
    }

    async fn refresh_marker(
        &self,
        user_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let gate = self
            .refresh_gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.check()?;
        let key = keys::user_online(user_id, instance_id);
        let mut inner = lock(&self.inner);
        if !inner.live_marker(&key) {
            return Ok(false);
        }
        inner.markers.insert(key, Instant::now() + ttl);
        Ok(true)
    }

    async fn delete_marker(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.inner)
            .markers
            .remove(&keys::user_online(user_id, instance_id));
        Ok(())
    }

    async fn marker_exists(&self, user_id: &str, instance_id: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(lock(&self.inner).live_marker(&keys::user_online(user_id, instance_id)))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = lock(&self.inner);
        if inner.failing_channels.contains(channel) {
            return Err(StoreError::Unavailable(format!("publish to {channel} rejected")));
        }
        if let Some(subs) = inner.subscribers.get_mut(channel) {
            subs.retain(|(_, tx)| tx.send(payload.to_string()).is_ok());
        }
        inner
            .published
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));
        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            channel: channel.to_string(),
            id,
            rx,
        }))
    }
}

struct MemorySubscription {
    inner: Arc<Mutex<Inner>>,
    channel: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_payload(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        if let Some(subs) = inner.subscribers.get_mut(&self.channel) {
            subs.retain(|(id, _)| *id != self.id);
        }
        Ok(())
    }
}
