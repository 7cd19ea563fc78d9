use std::{fmt::Display, sync::Arc};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    futures::{Sink, SinkExt, StreamExt},
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

use switchboard_protocol::close_codes;

use crate::{
    heartbeat::Heartbeat,
    hooks::GatewayHooks,
    reader,
    state::{Connection, GatewayState, Outbound},
};

/// Drive one upgraded socket from registration to teardown.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, user_id: String) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let conn = Arc::new(Connection::new(user_id, state.instance_id.clone(), tx));

    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        Arc::clone(&state.hooks),
        conn.conn_id.clone(),
    ));

    if let Err(e) = state.register(Arc::clone(&conn)).await {
        warn!(user_id = %conn.user_id, error = %e, "registration failed, closing connection");
        drop(conn);
        let _ = writer.await;
        return;
    }

    conn.attach_heartbeat(Heartbeat::for_connection(&state, &conn).spawn(conn.cancel_token()));

    // The token also fires when the instance tears the connection down.
    let cancel = conn.cancel_token();
    tokio::select! {
        _ = reader::run(&state, &conn, &mut stream) => {},
        _ = cancel.cancelled() => {
            debug!(user_id = %conn.user_id, conn_id = %conn.conn_id, "connection closed by server");
        },
    }

    state.unregister(&conn).await;
    let _ = writer.await;
}

/// Owns the sink; every socket write goes through here. A frame counts as
/// delivered only once the sink accepted it.
async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    hooks: Arc<dyn GatewayHooks>,
    conn_id: String,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(conn_id = %conn_id, error = %e, "socket write failed");
                    break;
                }
                hooks.on_message_delivered();
            },
            Outbound::Close => {
                let frame = CloseFrame {
                    code: close_codes::NORMAL,
                    reason: "".into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            },
        }
    }
    let _ = sink.close().await;
}
