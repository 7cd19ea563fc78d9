//! Per-connection liveness monitor.
//!
//! Every interval the presence marker's TTL is pushed forward. The TTL is
//! longer than the interval, so an on-time heartbeat always lands before the
//! marker lapses; once the heartbeat stops the marker expires on its own.

use std::{sync::Arc, time::Duration};

use {
    tokio::{
        task::JoinHandle,
        time::{Instant, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    presence::{self, PresenceStore},
    state::{Connection, GatewayState},
};

pub struct Heartbeat {
    store: Arc<dyn PresenceStore>,
    user_id: String,
    instance_id: String,
    interval: Duration,
    ttl: Duration,
}

impl Heartbeat {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        user_id: impl Into<String>,
        instance_id: impl Into<String>,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            user_id: user_id.into(),
            instance_id: instance_id.into(),
            interval,
            ttl,
        }
    }

    pub fn for_connection(state: &GatewayState, conn: &Connection) -> Self {
        Self::new(
            Arc::clone(&state.store),
            conn.user_id.clone(),
            state.instance_id.clone(),
            state.presence.heartbeat_interval(),
            state.presence.marker_ttl(),
        )
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Refresh until `cancel` fires. Store errors never end the loop.
    ///
    /// Cancellation is observed between ticks; a refresh already in flight
    /// runs to completion but never re-announces once cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            self.beat(&cancel).await;
        }
        debug!(user_id = %self.user_id, "heartbeat stopped");
    }

    async fn beat(&self, cancel: &CancellationToken) {
        match self
            .store
            .refresh_marker(&self.user_id, &self.instance_id, self.ttl)
            .await
        {
            Ok(true) => debug!(user_id = %self.user_id, "presence refreshed"),
            Ok(false) if cancel.is_cancelled() => {
                debug!(user_id = %self.user_id, "marker gone after cancel, not re-announcing");
            },
            Ok(false) => {
                warn!(user_id = %self.user_id, "presence marker missing, re-announcing");
                if let Err(e) = presence::announce(
                    self.store.as_ref(),
                    &self.user_id,
                    &self.instance_id,
                    self.ttl,
                )
                .await
                {
                    warn!(user_id = %self.user_id, error = %e, "failed to re-announce presence");
                }
            },
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "heartbeat refresh failed");
            },
        }
    }
}
