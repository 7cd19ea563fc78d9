//! End-to-end routing across gateway instances sharing one presence store.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    serde_json::json,
    tokio::{net::TcpListener, sync::mpsc, task::JoinHandle},
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{
            self, Message,
            protocol::{CloseFrame, frame::coding::CloseCode},
        },
    },
    tokio_util::sync::CancellationToken,
};

use {
    switchboard_config::PresenceConfig,
    switchboard_gateway::{
        heartbeat::Heartbeat,
        hooks::NoopHooks,
        memory_store::MemoryPresenceStore,
        presence::{self, PresenceStore},
        relay, sender,
        server::serve,
        state::{Connection, GatewayState, Outbound},
    },
    switchboard_protocol::{Envelope, MessageType},
};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct Instance {
    state: Arc<GatewayState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Instance {
    async fn spawn(id: &str, store: &Arc<MemoryPresenceStore>) -> Self {
        let state = GatewayState::new(
            id,
            Arc::clone(store) as Arc<dyn PresenceStore>,
            Arc::new(NoopHooks),
            PresenceConfig::default(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(
            Arc::clone(&state),
            listener,
            shutdown.clone().cancelled_owned(),
        ));

        let channel = format!("server:{id}");
        eventually(|| store.subscriber_count(&channel) == 1).await;
        Self {
            state,
            addr,
            shutdown,
            handle,
        }
    }

    async fn connect(&self, user: &str) -> Client {
        let before = self.state.connection_count().await;
        let url = format!("ws://{}/ws?userId={user}", self.addr);
        let (client, _) = connect_async(url).await.unwrap();
        for _ in 0..500 {
            if self.state.connection_count().await > before {
                return client;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{user} never registered");
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn send_json(client: &mut Client, value: serde_json::Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn next_envelope(client: &mut Client) -> Envelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return Envelope::from_json(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn chat_crosses_instances_with_sender_stamped() {
    let store = Arc::new(MemoryPresenceStore::new());
    let a = Instance::spawn("a", &store).await;
    let b = Instance::spawn("b", &store).await;

    let mut alice = a.connect("alice").await;
    let mut bob = b.connect("bob").await;
    assert!(store.is_member("alice", "a"));
    assert!(store.is_member("bob", "b"));

    send_json(
        &mut bob,
        json!({
            "type": "chat_message",
            "receiverID": "alice",
            "payload": {"text": "hello from b"},
            "senderId": "someone-else",
        }),
    )
    .await;

    let env = next_envelope(&mut alice).await;
    assert_eq!(env.kind, MessageType::ChatMessage);
    assert_eq!(env.sender_id, "bob");
    assert_eq!(env.receiver_id, "alice");
    assert_eq!(env.payload, json!({"text": "hello from b"}));
    assert!(env.timestamp.is_some());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn send_to_unknown_user_publishes_nothing() {
    let store = Arc::new(MemoryPresenceStore::new());
    let a = Instance::spawn("a", &store).await;
    let b = Instance::spawn("b", &store).await;
    let mut alice = a.connect("alice").await;
    let mut bob = b.connect("bob").await;

    send_json(
        &mut bob,
        json!({"type": "chat_message", "receiverID": "carol", "payload": "anyone?"}),
    )
    .await;
    // Frames from one connection are handled in order, so once this arrives
    // the first message has been routed (or dropped).
    send_json(
        &mut bob,
        json!({"type": "chat_message", "receiverID": "alice", "payload": "marker"}),
    )
    .await;
    assert_eq!(next_envelope(&mut alice).await.payload, json!("marker"));

    let published = store.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "server:a");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn every_device_of_a_user_receives() {
    let store = Arc::new(MemoryPresenceStore::new());
    let a = Instance::spawn("a", &store).await;
    let b = Instance::spawn("b", &store).await;
    let mut phone = a.connect("alice").await;
    let mut laptop = b.connect("alice").await;
    let mut tablet = b.connect("alice").await;
    let mut bob = a.connect("bob").await;

    send_json(
        &mut bob,
        json!({"type": "chat_message", "receiverID": "alice", "payload": 7}),
    )
    .await;
    for client in [&mut phone, &mut laptop, &mut tablet] {
        assert_eq!(next_envelope(client).await.payload, json!(7));
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn clean_close_tears_down_presence() {
    let store = Arc::new(MemoryPresenceStore::new());
    let a = Instance::spawn("a", &store).await;
    let mut alice = a.connect("alice").await;
    assert!(store.marker_ttl("alice", "a").is_some());

    alice
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }))
        .await
        .unwrap();

    for _ in 0..500 {
        if a.state.connection_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(a.state.connection_count().await, 0);
    eventually(|| !store.is_member("alice", "a")).await;
    assert!(store.marker_ttl("alice", "a").is_none());

    a.stop().await;
}

#[tokio::test]
async fn shutdown_closes_clients_and_clears_presence() {
    let store = Arc::new(MemoryPresenceStore::new());
    let a = Instance::spawn("a", &store).await;
    let mut alice = a.connect("alice").await;

    a.stop().await;

    assert!(!store.is_member("alice", "a"));
    assert_eq!(store.subscriber_count("server:a"), 0);
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(msg) = alice.next().await {
            if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                return;
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn upgrade_without_user_is_rejected() {
    let store = Arc::new(MemoryPresenceStore::new());
    let a = Instance::spawn("a", &store).await;

    for url in [
        format!("ws://{}/ws", a.addr),
        format!("ws://{}/ws?userId=", a.addr),
    ] {
        match connect_async(url).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 400),
            Err(e) => panic!("expected HTTP 400, got {e}"),
            Ok(_) => panic!("upgrade without userId succeeded"),
        }
    }
    assert_eq!(a.state.connection_count().await, 0);

    a.stop().await;
}

#[tokio::test(start_paused = true)]
async fn crashed_instance_is_pruned_once_its_marker_expires() {
    let store = Arc::new(MemoryPresenceStore::new());
    let presence_config = PresenceConfig::default();

    // "dead" announced alice and then vanished without cleaning up.
    presence::announce(store.as_ref(), "alice", "dead", presence_config.marker_ttl())
        .await
        .unwrap();

    let live = GatewayState::new(
        "live",
        Arc::clone(&store) as Arc<dyn PresenceStore>,
        Arc::new(NoopHooks),
        presence_config.clone(),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Arc::new(Connection::new("alice", "live", tx));
    live.register(Arc::clone(&conn)).await.unwrap();
    conn.attach_heartbeat(Heartbeat::for_connection(&live, &conn).spawn(conn.cancel_token()));
    let relay_shutdown = CancellationToken::new();
    let relay = relay::start(Arc::clone(&live), relay_shutdown.clone())
        .await
        .unwrap();

    tokio::time::sleep(presence_config.marker_ttl() + Duration::from_secs(1)).await;
    assert!(store.is_member("alice", "dead"));
    assert!(store.marker_ttl("alice", "dead").is_none());
    assert!(store.marker_ttl("alice", "live").is_some());

    let mut env = Envelope::new(MessageType::ChatMessage, "alice", json!("ping"));
    env.sender_id = "bob".into();
    let report = sender::send(store.as_ref(), &env).await.unwrap();
    assert_eq!(report.stale, vec!["dead"]);
    assert_eq!(report.published, vec!["live"]);
    assert!(!store.is_member("alice", "dead"));
    assert!(
        store
            .published()
            .iter()
            .all(|(channel, _)| channel != "server:dead")
    );

    let Some(Outbound::Text(frame)) = rx.recv().await else {
        panic!("expected delivery on the live instance");
    };
    assert_eq!(Envelope::from_json(&frame).unwrap(), env);

    live.unregister(&conn).await;
    relay_shutdown.cancel();
    relay.await.unwrap();
}
