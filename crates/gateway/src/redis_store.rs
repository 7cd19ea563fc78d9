use std::time::Duration;

use {
    async_trait::async_trait,
    futures::StreamExt,
    redis::{
        FromRedisValue,
        aio::{ConnectionManager, ConnectionManagerConfig, PubSub},
    },
    tracing::{debug, warn},
};

use {switchboard_config::RedisConfig, switchboard_protocol::keys};

use crate::presence::{PresenceStore, StoreError, Subscription};

/// Redis-backed presence store.
///
/// Commands share one managed multiplexed connection that is re-established
/// after I/O failures; every subscription opens its own dedicated pub/sub
/// connection. Only single-node endpoints are supported.
#[derive(Clone)]
pub struct RedisPresenceStore {
    client: redis::Client,
    conn: ConnectionManager,
    connect_timeout: Duration,
    response_timeout: Duration,
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisPresenceStore {
    /// Open a managed connection and verify the server answers PING.
    ///
    /// `connect_timeout` bounds each (re)connection attempt and
    /// `response_timeout` bounds every command afterwards.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;
        let connect_timeout = config.connect_timeout();
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(connect_timeout)
            .set_response_timeout(config.response_timeout());
        let conn = tokio::time::timeout(
            connect_timeout,
            ConnectionManager::new_with_config(client.clone(), manager_config),
        )
        .await
        .map_err(|_| {
            StoreError::Unavailable(format!("connect timed out after {connect_timeout:?}"))
        })??;
        let store = Self {
            client,
            conn,
            connect_timeout,
            response_timeout: config.response_timeout(),
        };
        store.ping().await?;
        Ok(store)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let pong: String = self.run(&redis::cmd("PING")).await?;
        debug!(reply = %pong, "presence store reachable");
        Ok(())
    }

    /// Run one command, bounded by the response timeout even while the
    /// manager is still reconnecting.
    async fn run<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        let timeout = self.response_timeout;
        tokio::time::timeout(timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Unavailable(format!("no reply within {timeout:?}")))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add_member(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError> {
        let _: () = self
            .run(
                redis::cmd("SADD")
                    .arg(keys::user_servers(user_id))
                    .arg(instance_id),
            )
            .await?;
        Ok(())
    }

    async fn remove_member(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError> {
        let _: () = self
            .run(
                redis::cmd("SREM")
                    .arg(keys::user_servers(user_id))
                    .arg(instance_id),
            )
            .await?;
        Ok(())
    }

    async fn members(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let members: Vec<String> = self
            .run(redis::cmd("SMEMBERS").arg(keys::user_servers(user_id)))
            .await?;
        Ok(members)
    }

    async fn set_marker(
        &self,
        user_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let _: () = self
            .run(
                redis::cmd("SET")
                    .arg(keys::user_online(user_id, instance_id))
                    .arg("1")
                    .arg("PX")
                    .arg(millis(ttl)),
            )
            .await?;
        Ok(())
    }

    async fn refresh_marker(
        &self,
        user_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let updated: bool = self
            .run(
                redis::cmd("PEXPIRE")
                    .arg(keys::user_online(user_id, instance_id))
                    .arg(millis(ttl)),
            )
            .await?;
        Ok(updated)
    }

    async fn delete_marker(&self, user_id: &str, instance_id: &str) -> Result<(), StoreError> {
        let _: () = self
            .run(redis::cmd("DEL").arg(keys::user_online(user_id, instance_id)))
            .await?;
        Ok(())
    }

    async fn marker_exists(&self, user_id: &str, instance_id: &str) -> Result<bool, StoreError> {
        let count: i64 = self
            .run(redis::cmd("EXISTS").arg(keys::user_online(user_id, instance_id)))
            .await?;
        Ok(count > 0)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let receivers: i64 = self
            .run(redis::cmd("PUBLISH").arg(channel).arg(payload))
            .await?;
        if receivers == 0 {
            debug!(channel, "published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError> {
        let timeout = self.connect_timeout;
        let mut pubsub = tokio::time::timeout(timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| StoreError::Unavailable(format!("subscribe timed out after {timeout:?}")))??;
        pubsub.subscribe(channel).await?;
        Ok(Box::new(RedisSubscription {
            pubsub,
            channel: channel.to_string(),
        }))
    }
}

struct RedisSubscription {
    pubsub: PubSub,
    channel: String,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_payload(&mut self) -> Option<String> {
        let messages = self.pubsub.on_message();
        tokio::pin!(messages);
        loop {
            let msg = messages.next().await?;
            match msg.get_payload::<String>() {
                Ok(payload) => return Some(payload),
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "non-text pub/sub payload, skipping");
                },
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = *self;
        this.pubsub.unsubscribe(&this.channel).await?;
        Ok(())
    }
}
