use {anyhow::Result, chrono::Utc};

use {
    switchboard_config::SwitchboardConfig,
    switchboard_gateway::{presence::PresenceStore, redis_store::RedisPresenceStore, sender},
    switchboard_protocol::Envelope,
};

async fn connect(config: &SwitchboardConfig) -> Result<RedisPresenceStore> {
    let store = RedisPresenceStore::connect(&config.redis).await?;
    Ok(store)
}

/// Publish a system-originated envelope (empty sender) to `to`.
pub async fn send(config: &SwitchboardConfig, to: &str, kind: &str, payload: &str) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| anyhow::anyhow!("payload is not valid JSON: {e}"))?;
    let mut envelope = Envelope::new(kind, to, payload);
    envelope.stamp("", Utc::now());

    let store = connect(config).await?;
    let report = sender::send(&store, &envelope).await?;

    if report.is_undeliverable() {
        println!("{to} is not connected to any instance");
    }
    for instance in &report.published {
        println!("published to {instance}");
    }
    for instance in &report.stale {
        println!("removed stale membership {instance}");
    }
    for instance in &report.failed {
        println!("failed to reach {instance}");
    }
    Ok(())
}

/// Print membership and marker liveness for every instance listed for `user`.
pub async fn presence(config: &SwitchboardConfig, user: &str) -> Result<()> {
    let store = connect(config).await?;
    let members = store.members(user).await?;
    if members.is_empty() {
        println!("{user}: offline");
        return Ok(());
    }
    println!("{user}:");
    for instance in members {
        let state = if store.marker_exists(user, &instance).await? {
            "online"
        } else {
            "stale"
        };
        println!("  {instance:<40} {state}");
    }
    Ok(())
}
