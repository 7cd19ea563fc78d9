//! Presence keyspace: `user_servers:{user}`, `user_online:{user}:{instance}`
//! and the routing channel `server:{instance}`.

pub const USER_SERVERS_PREFIX: &str = "user_servers:";
pub const USER_ONLINE_PREFIX: &str = "user_online:";
pub const SERVER_CHANNEL_PREFIX: &str = "server:";

/// Set of instance ids the user is believed to be connected to.
pub fn user_servers(user_id: &str) -> String {
    format!("{USER_SERVERS_PREFIX}{user_id}")
}

/// TTL-bearing marker proving `user_id` is live on `instance_id`.
pub fn user_online(user_id: &str, instance_id: &str) -> String {
    format!("{USER_ONLINE_PREFIX}{user_id}:{instance_id}")
}

/// Pub/sub channel an instance's relay listens on.
pub fn server_channel(instance_id: &str) -> String {
    format!("{SERVER_CHANNEL_PREFIX}{instance_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(user_servers("alice"), "user_servers:alice");
        assert_eq!(user_online("alice", "i-1"), "user_online:alice:i-1");
        assert_eq!(server_channel("i-1"), "server:i-1");
    }
}
