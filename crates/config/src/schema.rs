//! Config schema types (server, redis, presence).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub presence: PresenceConfig,
}

/// HTTP/WebSocket listener and instance identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Fixed instance id. A fresh UUID is generated per process when unset.
    pub instance_id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8081,
            instance_id: None,
        }
    }
}

/// Presence store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// `redis://[:password@]host:port[/db]`
    pub url: String,
    /// Timeout for each connection attempt, including reconnects.
    pub connect_timeout_secs: u64,
    /// Upper bound on any single command round trip.
    pub response_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            connect_timeout_secs: 5,
            response_timeout_ms: 3_000,
        }
    }
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// The URL with any password replaced, for logging.
    pub fn redacted_url(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(mut u) => {
                if u.password().is_some() {
                    let _ = u.set_password(Some("***"));
                }
                u.to_string()
            },
            Err(_) => "<invalid redis url>".into(),
        }
    }
}

/// Heartbeat cadence and presence marker lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_interval_secs: u64,
    /// Must be strictly greater than the heartbeat interval.
    pub marker_ttl_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            marker_ttl_secs: 60,
        }
    }
}

impl PresenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn marker_ttl(&self) -> Duration {
        Duration::from_secs(self.marker_ttl_secs)
    }
}

impl SwitchboardConfig {
    /// Reject settings under which presence markers could lapse between two
    /// on-time heartbeats.
    pub fn validate(&self) -> anyhow::Result<()> {
        let p = &self.presence;
        if p.heartbeat_interval_secs == 0 {
            anyhow::bail!("presence.heartbeat_interval_secs must be greater than zero");
        }
        if p.marker_ttl_secs <= p.heartbeat_interval_secs {
            anyhow::bail!(
                "presence.marker_ttl_secs ({}) must exceed presence.heartbeat_interval_secs ({})",
                p.marker_ttl_secs,
                p.heartbeat_interval_secs
            );
        }
        if let Some(id) = &self.server.instance_id
            && (id.is_empty() || id.contains(':'))
        {
            anyhow::bail!("server.instance_id must be non-empty and must not contain ':'");
        }
        if self.redis.response_timeout_ms == 0 {
            anyhow::bail!("redis.response_timeout_ms must be greater than zero");
        }
        url::Url::parse(&self.redis.url)
            .map_err(|e| anyhow::anyhow!("invalid redis.url: {e}"))?;
        Ok(())
    }
}
