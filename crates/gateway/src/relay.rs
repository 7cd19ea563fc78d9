//! Fan-in: consume this instance's routing channel and hand each envelope to
//! the receiver's local sockets.

use std::{sync::Arc, time::Duration};

use {
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use switchboard_protocol::{Envelope, keys};

use crate::{
    presence::{StoreError, Subscription},
    state::GatewayState,
};

const RESUBSCRIBE_INITIAL: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(5);

/// Subscribe to `server:{instance}` and spawn the relay loop.
///
/// The first subscription happens before this returns, so a store that is
/// down at boot is an error here rather than a silent retry loop.
pub async fn start(
    state: Arc<GatewayState>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, StoreError> {
    let channel = keys::server_channel(&state.instance_id);
    let subscription = state.store.subscribe(&channel).await?;
    info!(channel = %channel, "relay subscribed");
    Ok(tokio::spawn(run(state, subscription, channel, shutdown)))
}

async fn run(
    state: Arc<GatewayState>,
    mut subscription: Box<dyn Subscription>,
    channel: String,
    shutdown: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            payload = subscription.next_payload() => payload,
        };
        match payload {
            Some(payload) => handle_payload(&state, &payload).await,
            None => {
                warn!(channel = %channel, "relay subscription lost, resubscribing");
                match resubscribe(&state, &channel, &shutdown).await {
                    Some(fresh) => subscription = fresh,
                    None => return,
                }
            },
        }
    }

    if let Err(e) = subscription.unsubscribe().await {
        warn!(channel = %channel, error = %e, "relay unsubscribe failed");
    }
    info!(channel = %channel, "relay stopped");
}

/// Retry with exponential backoff until subscribed or shut down.
async fn resubscribe(
    state: &GatewayState,
    channel: &str,
    shutdown: &CancellationToken,
) -> Option<Box<dyn Subscription>> {
    let mut backoff = RESUBSCRIBE_INITIAL;
    loop {
        match state.store.subscribe(channel).await {
            Ok(subscription) => {
                info!(channel, "relay resubscribed");
                return Some(subscription);
            },
            Err(e) => {
                warn!(channel, error = %e, retry_ms = backoff.as_millis() as u64, "resubscribe failed");
            },
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(backoff) => {},
        }
        backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
    }
}

async fn handle_payload(state: &GatewayState, payload: &str) {
    let envelope = match Envelope::from_json(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "relay dropped undecodable payload");
            return;
        },
    };
    if !envelope.has_receiver() {
        warn!(kind = %envelope.kind, "relay dropped envelope without receiver");
        return;
    }
    deliver_local(state, &envelope).await;
}

/// Queue `envelope` on every local connection of its receiver. Returns how
/// many write loops accepted it; the delivered hook fires in the write loop
/// once the socket write succeeds.
///
/// Finding no local connection is not an error: the receiver may have
/// disconnected after the sender read the membership set.
pub async fn deliver_local(state: &GatewayState, envelope: &Envelope) -> usize {
    let conns = state.local_connections_for(&envelope.receiver_id).await;
    if conns.is_empty() {
        debug!(receiver = %envelope.receiver_id, "receiver not connected locally");
        return 0;
    }

    let frame = match envelope.to_json() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "failed to encode envelope for delivery");
            return 0;
        },
    };

    let mut queued = 0;
    for conn in conns {
        if conn.send(&frame) {
            queued += 1;
        } else {
            warn!(
                receiver = %envelope.receiver_id,
                conn_id = %conn.conn_id,
                "local delivery failed, writer gone"
            );
        }
    }
    debug!(receiver = %envelope.receiver_id, queued, "relay queued for local delivery");
    queued
}
