use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{
            Query, State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection,
        },
        http::StatusCode,
        response::{IntoResponse, Json, Response},
        routing::get,
    },
    serde::Deserialize,
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::info,
};

use switchboard_config::SwitchboardConfig;

use crate::{
    hooks::GatewayHooks,
    presence::PresenceStore,
    redis_store::RedisPresenceStore,
    relay,
    state::GatewayState,
    ws::handle_connection,
};

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Run the relay and the HTTP server on `listener` until `shutdown` resolves,
/// then stop the relay and tear down every local connection.
pub async fn serve<F>(
    state: Arc<GatewayState>,
    listener: TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let relay_shutdown = CancellationToken::new();
    let relay = relay::start(Arc::clone(&state), relay_shutdown.clone()).await?;

    let app = build_gateway_app(Arc::clone(&state));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    info!("shutting down");
    relay_shutdown.cancel();
    let _ = relay.await;
    state.shutdown().await;
    served?;
    Ok(())
}

/// Start the gateway HTTP + WebSocket server against Redis.
pub async fn start_gateway(config: SwitchboardConfig) -> anyhow::Result<()> {
    config.validate()?;

    let instance_id = config
        .server
        .instance_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let store = RedisPresenceStore::connect(&config.redis).await?;
    let store: Arc<dyn PresenceStore> = Arc::new(store);

    #[cfg(feature = "metrics")]
    let hooks: Arc<dyn GatewayHooks> =
        Arc::new(crate::hooks::MetricsHooks::new(instance_id.clone()));
    #[cfg(not(feature = "metrics"))]
    let hooks: Arc<dyn GatewayHooks> = Arc::new(crate::hooks::NoopHooks);

    let state = GatewayState::new(instance_id, store, hooks, config.presence.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("switchboard gateway v{}", state.version),
        format!("instance {} on {}", state.instance_id, state.hostname),
        format!("listening on {addr}"),
        format!("redis: {}", config.redis.redacted_url()),
        format!(
            "heartbeat {}s, presence ttl {}s",
            config.presence.heartbeat_interval_secs, config.presence.marker_ttl_secs
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    serve(state, listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "instance": state.instance_id,
        "version": state.version,
        "hostname": state.hostname,
        "connections": state.connection_count().await,
        "users": state.user_count().await,
    }))
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
}

/// The user check runs before the upgrade check so a plain GET without
/// `userId` gets a 400 rather than an upgrade error.
async fn ws_upgrade_handler(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<ConnectParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(user_id) = params.user_id.filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing userId").into_response();
    };
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_connection(socket, state, user_id)),
        Err(rejection) => rejection.into_response(),
    }
}
