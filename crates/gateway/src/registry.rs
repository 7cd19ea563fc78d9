use std::{collections::HashMap, sync::Arc};

use crate::state::Connection;

/// Result of removing a connection from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removed {
    /// The user has no other connection on this instance.
    pub last_for_user: bool,
}

/// Local connections grouped by user.
///
/// Plain data; [`crate::state::GatewayState`] wraps it in a single
/// reader/writer lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    /// user_id → conn_id → connection
    users: HashMap<String, HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Arc<Connection>) {
        self.users
            .entry(conn.user_id.clone())
            .or_default()
            .insert(conn.conn_id.clone(), conn);
    }

    /// Remove `conn`, dropping the user's bucket once it is empty.
    pub fn remove(&mut self, conn: &Connection) -> Option<Removed> {
        let bucket = self.users.get_mut(&conn.user_id)?;
        bucket.remove(&conn.conn_id)?;
        let last_for_user = bucket.is_empty();
        if last_for_user {
            self.users.remove(&conn.user_id);
        }
        Some(Removed { last_for_user })
    }

    /// Snapshot of the user's connections; empty if the user is unknown.
    pub fn connections_for(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.users
            .get(user_id)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.users
            .values()
            .flat_map(|bucket| bucket.values().cloned())
            .collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn connection_count(&self) -> usize {
        self.users.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tokio::sync::mpsc};

    fn conn(user: &str) -> Arc<Connection> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Connection::new(user, "i-1", tx))
    }

    #[test]
    fn insert_then_remove() {
        let mut reg = ConnectionRegistry::new();
        let c = conn("alice");
        reg.insert(Arc::clone(&c));
        let found = reg.connections_for("alice");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].conn_id, c.conn_id);

        assert_eq!(
            reg.remove(&c),
            Some(Removed {
                last_for_user: true
            })
        );
        assert!(reg.connections_for("alice").is_empty());
        assert!(!reg.has_user("alice"));
        assert_eq!(reg.user_count(), 0);
    }

    #[test]
    fn multi_device_keeps_bucket_until_last() {
        let mut reg = ConnectionRegistry::new();
        let phone = conn("alice");
        let laptop = conn("alice");
        reg.insert(Arc::clone(&phone));
        reg.insert(Arc::clone(&laptop));
        assert_eq!(reg.connection_count(), 2);
        assert_eq!(reg.user_count(), 1);

        assert_eq!(
            reg.remove(&phone),
            Some(Removed {
                last_for_user: false
            })
        );
        assert!(reg.has_user("alice"));
        assert_eq!(
            reg.remove(&laptop),
            Some(Removed {
                last_for_user: true
            })
        );
        assert!(!reg.has_user("alice"));
    }

    #[test]
    fn removing_twice_is_harmless() {
        let mut reg = ConnectionRegistry::new();
        let c = conn("alice");
        reg.insert(Arc::clone(&c));
        assert!(reg.remove(&c).is_some());
        assert!(reg.remove(&c).is_none());
    }

    #[test]
    fn users_are_isolated() {
        let mut reg = ConnectionRegistry::new();
        reg.insert(conn("alice"));
        reg.insert(conn("bob"));
        assert!(
            reg.connections_for("alice")
                .iter()
                .all(|c| c.user_id == "alice")
        );
        assert!(reg.connections_for("carol").is_empty());
        assert_eq!(reg.all().len(), 2);
    }
}
