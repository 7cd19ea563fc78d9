use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use {
    tokio::{
        sync::{RwLock, mpsc},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use switchboard_config::PresenceConfig;

use crate::{
    hooks::GatewayHooks,
    presence::{self, PresenceStore, StoreError},
    registry::ConnectionRegistry,
};

// ── Connection ───────────────────────────────────────────────────────────────

/// Frames queued for a connection's write loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Send a close frame and shut the socket.
    Close,
}

/// A WebSocket connection owned by this instance.
#[derive(Debug)]
pub struct Connection {
    pub conn_id: String,
    pub user_id: String,
    pub instance_id: String,
    pub connected_at: Instant,
    /// Feeds the write loop, which owns the socket sink.
    sender: mpsc::UnboundedSender<Outbound>,
    /// Stops the heartbeat.
    cancel: CancellationToken,
    /// Joined by teardown before presence is withdrawn.
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl Connection {
    pub fn new(
        user_id: impl Into<String>,
        instance_id: impl Into<String>,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            conn_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            instance_id: instance_id.into(),
            connected_at: Instant::now(),
            sender,
            cancel: CancellationToken::new(),
            heartbeat: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Queue a serialized frame. Returns `false` once the write loop is gone.
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(Outbound::Text(frame.to_string())).is_ok()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Hand the running heartbeat to the connection so teardown can wait
    /// for an in-flight refresh before withdrawing presence.
    pub fn attach_heartbeat(&self, handle: JoinHandle<()>) {
        *self.heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn take_heartbeat(&self) -> Option<JoinHandle<()>> {
        self.heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Single-fire guard: only the first caller gets `true`.
    fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    fn close(&self) {
        let _ = self.sender.send(Outbound::Close);
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("missing userId")]
    MissingUser,
    #[error("presence write failed: {0}")]
    Store(#[from] StoreError),
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Per-instance runtime state, shared across tasks behind an `Arc`.
pub struct GatewayState {
    pub instance_id: String,
    /// Server version string.
    pub version: String,
    pub hostname: String,
    pub presence: PresenceConfig,
    /// Local connections. One coarse lock for the whole table.
    pub registry: RwLock<ConnectionRegistry>,
    pub store: Arc<dyn PresenceStore>,
    pub hooks: Arc<dyn GatewayHooks>,
}

impl GatewayState {
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<dyn PresenceStore>,
        hooks: Arc<dyn GatewayHooks>,
        presence: PresenceConfig,
    ) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        Arc::new(Self {
            instance_id: instance_id.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            presence,
            registry: RwLock::new(ConnectionRegistry::new()),
            store,
            hooks,
        })
    }

    /// Insert `conn` locally, then claim presence in the store.
    ///
    /// A failed presence write rolls the local insert back and closes the
    /// connection, so nothing stays registered that routing cannot reach.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), RegisterError> {
        if conn.user_id.is_empty() {
            return Err(RegisterError::MissingUser);
        }

        self.registry.write().await.insert(Arc::clone(&conn));

        if let Err(e) = presence::announce(
            self.store.as_ref(),
            &conn.user_id,
            &self.instance_id,
            self.presence.marker_ttl(),
        )
        .await
        {
            warn!(
                user_id = %conn.user_id,
                conn_id = %conn.conn_id,
                error = %e,
                "presence write failed, rolling back registration"
            );
            self.teardown(&conn, false).await;
            return Err(e.into());
        }

        self.hooks.on_connect();
        info!(
            user_id = %conn.user_id,
            conn_id = %conn.conn_id,
            instance = %self.instance_id,
            "connection registered"
        );
        Ok(())
    }

    /// Tear `conn` down. Safe to call from any path, any number of times;
    /// returns `true` only for the call that did the work.
    pub async fn unregister(&self, conn: &Connection) -> bool {
        self.teardown(conn, true).await
    }

    async fn teardown(&self, conn: &Connection, notify: bool) -> bool {
        if !conn.begin_teardown() {
            return false;
        }
        conn.cancel.cancel();

        let removed = self.registry.write().await.remove(conn);
        conn.close();

        // A refresh still in flight could re-announce after the withdraw.
        if let Some(heartbeat) = conn.take_heartbeat() {
            let _ = heartbeat.await;
        }

        // Presence is per (user, instance): keep it while another local
        // connection of the same user is alive.
        if removed.is_some_and(|r| r.last_for_user) {
            presence::withdraw(self.store.as_ref(), &conn.user_id, &self.instance_id).await;
            // A registration may have landed between the removal and the
            // withdraw above; put its presence back.
            if self.registry.read().await.has_user(&conn.user_id) {
                debug!(user_id = %conn.user_id, "user reconnected during teardown, re-announcing");
                if let Err(e) = presence::announce(
                    self.store.as_ref(),
                    &conn.user_id,
                    &self.instance_id,
                    self.presence.marker_ttl(),
                )
                .await
                {
                    warn!(user_id = %conn.user_id, error = %e, "failed to re-announce presence");
                }
            }
        }

        if notify {
            self.hooks.on_disconnect();
            info!(
                user_id = %conn.user_id,
                conn_id = %conn.conn_id,
                instance = %self.instance_id,
                connected_secs = conn.connected_at.elapsed().as_secs(),
                "connection unregistered"
            );
        }
        true
    }

    /// Snapshot of the user's live local connections.
    pub async fn local_connections_for(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.registry.read().await.connections_for(user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connection_count()
    }

    pub async fn user_count(&self) -> usize {
        self.registry.read().await.user_count()
    }

    /// Tear down every local connection (instance shutdown).
    pub async fn shutdown(&self) {
        let conns = self.registry.read().await.all();
        if conns.is_empty() {
            return;
        }
        info!(count = conns.len(), "closing local connections");
        for conn in conns {
            self.unregister(&conn).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            heartbeat::Heartbeat, hooks::testing::CountingHooks,
            memory_store::MemoryPresenceStore,
        },
    };

    fn setup() -> (Arc<GatewayState>, Arc<MemoryPresenceStore>, Arc<CountingHooks>) {
        let store = Arc::new(MemoryPresenceStore::new());
        let hooks = Arc::new(CountingHooks::default());
        let state = GatewayState::new(
            "i-1",
            Arc::clone(&store) as Arc<dyn PresenceStore>,
            Arc::clone(&hooks) as Arc<dyn GatewayHooks>,
            PresenceConfig::default(),
        );
        (state, store, hooks)
    }

    fn conn(user: &str) -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Connection::new(user, "i-1", tx)), rx)
    }

    #[tokio::test]
    async fn register_makes_connection_visible_and_present() {
        let (state, store, hooks) = setup();
        let (c, _rx) = conn("alice");
        state.register(Arc::clone(&c)).await.unwrap();

        let local = state.local_connections_for("alice").await;
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].conn_id, c.conn_id);
        assert!(store.is_member("alice", "i-1"));
        assert!(store.marker_ttl("alice", "i-1").is_some());
        assert_eq!(CountingHooks::get(&hooks.connects), 1);
    }

    #[tokio::test]
    async fn unregister_removes_everything() {
        let (state, store, hooks) = setup();
        let (c, mut rx) = conn("alice");
        state.register(Arc::clone(&c)).await.unwrap();

        assert!(state.unregister(&c).await);
        assert!(state.local_connections_for("alice").await.is_empty());
        assert_eq!(state.user_count().await, 0);
        assert!(!store.is_member("alice", "i-1"));
        assert!(store.marker_ttl("alice", "i-1").is_none());
        assert!(c.cancel_token().is_cancelled());
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert_eq!(CountingHooks::get(&hooks.disconnects), 1);
    }

    #[tokio::test]
    async fn empty_user_is_rejected_without_state() {
        let (state, store, _) = setup();
        let (c, _rx) = conn("");
        assert!(matches!(
            state.register(c).await,
            Err(RegisterError::MissingUser)
        ));
        assert_eq!(state.connection_count().await, 0);
        assert!(store.published().is_empty());
    }

    #[tokio::test]
    async fn failed_presence_write_rolls_back() {
        let (state, store, hooks) = setup();
        let (c, mut rx) = conn("alice");
        store.set_unavailable(true);

        assert!(matches!(
            state.register(Arc::clone(&c)).await,
            Err(RegisterError::Store(_))
        ));
        assert_eq!(state.connection_count().await, 0);
        assert!(c.is_torn_down());
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert_eq!(CountingHooks::get(&hooks.connects), 0);
        assert_eq!(CountingHooks::get(&hooks.disconnects), 0);

        // Later unregister from the read loop is a no-op.
        store.set_unavailable(false);
        assert!(!state.unregister(&c).await);
    }

    #[tokio::test]
    async fn concurrent_teardown_runs_once() {
        let (state, _store, hooks) = setup();
        let (c, mut rx) = conn("alice");
        state.register(Arc::clone(&c)).await.unwrap();

        let (a, b) = tokio::join!(state.unregister(&c), state.unregister(&c));
        assert!(a ^ b);
        assert_eq!(CountingHooks::get(&hooks.disconnects), 1);
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        drop(c);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn second_device_keeps_presence() {
        let (state, store, _) = setup();
        let (phone, _p) = conn("alice");
        let (laptop, _l) = conn("alice");
        state.register(Arc::clone(&phone)).await.unwrap();
        state.register(Arc::clone(&laptop)).await.unwrap();

        state.unregister(&phone).await;
        assert!(store.is_member("alice", "i-1"));
        assert!(store.marker_ttl("alice", "i-1").is_some());
        assert_eq!(state.local_connections_for("alice").await.len(), 1);

        state.unregister(&laptop).await;
        assert!(!store.is_member("alice", "i-1"));
    }

    #[tokio::test]
    async fn teardown_survives_store_outage() {
        let (state, store, hooks) = setup();
        let (c, _rx) = conn("alice");
        state.register(Arc::clone(&c)).await.unwrap();

        store.set_unavailable(true);
        assert!(state.unregister(&c).await);
        store.set_unavailable(false);

        assert_eq!(state.connection_count().await, 0);
        assert_eq!(CountingHooks::get(&hooks.disconnects), 1);
        // Leaked presence is left for TTL expiry and stale cleanup.
        assert!(store.is_member("alice", "i-1"));
    }

    #[tokio::test]
    async fn shutdown_closes_all_connections() {
        let (state, store, hooks) = setup();
        let (a, _ra) = conn("alice");
        let (b, _rb) = conn("bob");
        state.register(Arc::clone(&a)).await.unwrap();
        state.register(Arc::clone(&b)).await.unwrap();

        state.shutdown().await;
        assert_eq!(state.connection_count().await, 0);
        assert!(a.is_torn_down() && b.is_torn_down());
        assert!(!store.is_member("alice", "i-1"));
        assert!(!store.is_member("bob", "i-1"));
        assert_eq!(CountingHooks::get(&hooks.disconnects), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_waits_for_in_flight_refresh() {
        let (state, store, _) = setup();
        let (c, _rx) = conn("alice");
        state.register(Arc::clone(&c)).await.unwrap();
        let gate = store.hold_next_refresh();
        c.attach_heartbeat(Heartbeat::for_connection(&state, &c).spawn(c.cancel_token()));

        gate.entered.notified().await;
        let teardown = tokio::spawn({
            let state = Arc::clone(&state);
            let c = Arc::clone(&c);
            async move { state.unregister(&c).await }
        });
        c.cancel_token().cancelled().await;
        gate.release.notify_one();

        assert!(teardown.await.unwrap());
        assert!(!store.is_member("alice", "i-1"));
        assert!(store.marker_ttl("alice", "i-1").is_none());

        // Nothing comes back once the clock moves on.
        tokio::time::sleep(state.presence.marker_ttl()).await;
        assert!(!store.is_member("alice", "i-1"));
    }
}
