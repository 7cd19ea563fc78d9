//! Fan-out origin: route an envelope to every instance holding the receiver.
//!
//! Delivery is at-most-once and best-effort. Membership entries without a
//! live marker are treated as stale and pruned on the way.

use tracing::{debug, warn};

use switchboard_protocol::{Envelope, ProtocolError, keys};

use crate::presence::{PresenceStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("envelope has no receiverID")]
    MissingReceiver,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to read membership: {0}")]
    Store(#[from] StoreError),
}

/// What happened to each candidate instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Instances the envelope was published to.
    pub published: Vec<String>,
    /// Stale memberships that were pruned.
    pub stale: Vec<String>,
    /// Instances whose presence check or publish failed.
    pub failed: Vec<String>,
}

impl SendReport {
    /// The receiver had no known live instance.
    pub fn is_undeliverable(&self) -> bool {
        self.published.is_empty()
    }
}

pub async fn send(store: &dyn PresenceStore, envelope: &Envelope) -> Result<SendReport, SendError> {
    if !envelope.has_receiver() {
        return Err(SendError::MissingReceiver);
    }
    let receiver = envelope.receiver_id.as_str();

    let candidates = store.members(receiver).await?;
    let mut report = SendReport::default();
    if candidates.is_empty() {
        debug!(receiver, "receiver not connected to any instance");
        return Ok(report);
    }

    let payload = envelope.to_json()?;

    for instance_id in candidates {
        match store.marker_exists(receiver, &instance_id).await {
            Ok(true) => {},
            Ok(false) => {
                debug!(receiver, instance_id = %instance_id, "pruning stale membership");
                if let Err(e) = store.remove_member(receiver, &instance_id).await {
                    warn!(
                        receiver,
                        instance_id = %instance_id,
                        error = %e,
                        "failed to remove stale membership"
                    );
                }
                report.stale.push(instance_id);
                continue;
            },
            Err(e) => {
                warn!(
                    receiver,
                    instance_id = %instance_id,
                    error = %e,
                    "presence check failed, skipping instance"
                );
                report.failed.push(instance_id);
                continue;
            },
        }

        let channel = keys::server_channel(&instance_id);
        match store.publish(&channel, &payload).await {
            Ok(()) => report.published.push(instance_id),
            Err(e) => {
                warn!(channel = %channel, error = %e, "publish failed");
                report.failed.push(instance_id);
            },
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use {
        super::*, crate::memory_store::MemoryPresenceStore, serde_json::json, std::time::Duration,
        switchboard_protocol::MessageType,
    };

    const TTL: Duration = Duration::from_secs(60);

    fn chat(to: &str) -> Envelope {
        let mut env = Envelope::new(MessageType::ChatMessage, to, json!("hi"));
        env.sender_id = "bob".into();
        env
    }

    async fn online(store: &MemoryPresenceStore, user: &str, instance: &str) {
        store.add_member(user, instance).await.unwrap();
        store.set_marker(user, instance, TTL).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_missing_receiver() {
        let store = MemoryPresenceStore::new();
        assert!(matches!(
            send(&store, &chat("")).await,
            Err(SendError::MissingReceiver)
        ));
        assert!(store.published().is_empty());
    }

    #[tokio::test]
    async fn unknown_receiver_is_a_noop() {
        let store = MemoryPresenceStore::new();
        let report = send(&store, &chat("carol")).await.unwrap();
        assert!(report.is_undeliverable());
        assert_eq!(report, SendReport::default());
        assert!(store.published().is_empty());
    }

    #[tokio::test]
    async fn publishes_to_every_live_instance() {
        let store = MemoryPresenceStore::new();
        online(&store, "alice", "i-1").await;
        online(&store, "alice", "i-2").await;

        let report = send(&store, &chat("alice")).await.unwrap();
        assert_eq!(report.published, vec!["i-1", "i-2"]);

        let published = store.published();
        let channels: Vec<_> = published.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(channels, vec!["server:i-1", "server:i-2"]);
        let decoded = Envelope::from_json(&published[0].1).unwrap();
        assert_eq!(decoded, chat("alice"));
    }

    #[tokio::test]
    async fn prunes_stale_membership_without_publishing() {
        let store = MemoryPresenceStore::new();
        online(&store, "alice", "i-1").await;
        // Membership left behind by a crashed instance, no marker.
        store.add_member("alice", "i-dead").await.unwrap();

        let report = send(&store, &chat("alice")).await.unwrap();
        assert_eq!(report.published, vec!["i-1"]);
        assert_eq!(report.stale, vec!["i-dead"]);
        assert!(!store.is_member("alice", "i-dead"));
        assert!(
            store
                .published()
                .iter()
                .all(|(channel, _)| channel != "server:i-dead")
        );
    }

    #[tokio::test]
    async fn publish_failure_does_not_stop_fanout() {
        let store = MemoryPresenceStore::new();
        online(&store, "alice", "i-1").await;
        online(&store, "alice", "i-2").await;
        online(&store, "alice", "i-3").await;
        store.fail_publish_to("server:i-1");

        let report = send(&store, &chat("alice")).await.unwrap();
        assert_eq!(report.failed, vec!["i-1"]);
        assert_eq!(report.published, vec!["i-2", "i-3"]);
        // A failed publish is not stale membership.
        assert!(store.is_member("alice", "i-1"));
    }

    #[tokio::test]
    async fn membership_read_failure_is_reported() {
        let store = MemoryPresenceStore::new();
        online(&store, "alice", "i-1").await;
        store.set_unavailable(true);
        assert!(matches!(
            send(&store, &chat("alice")).await,
            Err(SendError::Store(_))
        ));
    }
}
