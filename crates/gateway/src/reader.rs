//! Inbound side of a connection: decode client frames and dispatch them.

use {
    axum::extract::ws::{CloseFrame, Message},
    chrono::Utc,
    futures::{Stream, StreamExt},
    tracing::{debug, info, warn},
};

use switchboard_protocol::{Envelope, MessageType, close_codes};

use crate::{
    sender,
    state::{Connection, GatewayState},
};

/// How a read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// Peer closed with normal closure or going-away.
    Clean { code: u16 },
    /// Any other close code, a missing close frame, or a transport error.
    Abnormal { reason: String },
}

impl Disconnect {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean { .. })
    }
}

pub fn classify_close(frame: Option<&CloseFrame>) -> Disconnect {
    match frame {
        Some(f) if close_codes::is_clean(f.code) => Disconnect::Clean { code: f.code },
        Some(f) => Disconnect::Abnormal {
            reason: format!("close code {} ({})", f.code, f.reason.as_str()),
        },
        None => Disconnect::Abnormal {
            reason: "close frame without status".into(),
        },
    }
}

/// Read frames until the transport ends, then report how it ended.
///
/// Decode failures are dropped without closing the connection. Abnormal
/// endings fire the unexpected-disconnect hook; teardown is the caller's job.
pub async fn run<S>(state: &GatewayState, conn: &Connection, mut frames: S) -> Disconnect
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let outcome = loop {
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Disconnect::Abnormal {
                reason: e.to_string(),
            },
            None => break Disconnect::Abnormal {
                reason: "stream ended without close frame".into(),
            },
        };
        match frame {
            Message::Text(text) => handle_text(state, conn, text.as_str()).await,
            Message::Binary(bytes) => {
                debug!(user_id = %conn.user_id, len = bytes.len(), "ignoring binary frame");
            },
            Message::Ping(_) | Message::Pong(_) => {},
            Message::Close(frame) => break classify_close(frame.as_ref()),
        }
    };

    match &outcome {
        Disconnect::Clean { code } => {
            info!(user_id = %conn.user_id, conn_id = %conn.conn_id, code, "connection closed normally");
        },
        Disconnect::Abnormal { reason } => {
            state.hooks.on_unexpected_disconnect();
            warn!(user_id = %conn.user_id, conn_id = %conn.conn_id, reason = %reason, "unexpected disconnect");
        },
    }
    outcome
}

async fn handle_text(state: &GatewayState, conn: &Connection, text: &str) {
    let mut envelope = match Envelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(user_id = %conn.user_id, error = %e, "invalid message from client");
            return;
        },
    };
    envelope.stamp(&conn.user_id, Utc::now());
    state.hooks.on_message_received();
    dispatch(state, conn, envelope).await;
}

async fn dispatch(state: &GatewayState, conn: &Connection, envelope: Envelope) {
    match &envelope.kind {
        MessageType::ChatMessage => {
            debug!(user_id = %conn.user_id, receiver = %envelope.receiver_id, "chat message");
            match sender::send(state.store.as_ref(), &envelope).await {
                Ok(report) => debug!(
                    receiver = %envelope.receiver_id,
                    published = report.published.len(),
                    stale = report.stale.len(),
                    failed = report.failed.len(),
                    "chat message routed"
                ),
                Err(e) => {
                    warn!(user_id = %conn.user_id, receiver = %envelope.receiver_id, error = %e, "failed to route chat message");
                },
            }
        },
        MessageType::LatencyReport => match envelope.latency_ms() {
            Some(ms) => state.hooks.on_latency_report(ms),
            None => warn!(user_id = %conn.user_id, "malformed latency report"),
        },
        other => {
            warn!(user_id = %conn.user_id, kind = %other, "unhandled message type, dropping");
        },
    }
}
