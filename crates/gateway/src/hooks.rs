//! Side-effecting notifications fired at connection and delivery milestones.
//!
//! Hooks never influence control flow. Every method defaults to a no-op.

pub trait GatewayHooks: Send + Sync {
    fn on_connect(&self) {}
    fn on_disconnect(&self) {}
    fn on_unexpected_disconnect(&self) {}
    /// An envelope from a local client decoded successfully.
    fn on_message_received(&self) {}
    /// A relayed envelope was written to a local socket.
    fn on_message_delivered(&self) {}
    fn on_latency_report(&self, _latency_ms: f64) {}
}

pub struct NoopHooks;

impl GatewayHooks for NoopHooks {}

/// Records hook events through the `metrics` facade.
#[cfg(feature = "metrics")]
pub struct MetricsHooks {
    instance_id: String,
}

#[cfg(feature = "metrics")]
impl MetricsHooks {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }
}

#[cfg(feature = "metrics")]
impl GatewayHooks for MetricsHooks {
    fn on_connect(&self) {
        use switchboard_metrics::{connections, counter, gauge, labels};
        gauge!(connections::ACTIVE, labels::INSTANCE => self.instance_id.clone()).increment(1.0);
        counter!(connections::OPENED_TOTAL, labels::INSTANCE => self.instance_id.clone())
            .increment(1);
    }

    fn on_disconnect(&self) {
        use switchboard_metrics::{connections, gauge, labels};
        gauge!(connections::ACTIVE, labels::INSTANCE => self.instance_id.clone()).decrement(1.0);
    }

    fn on_unexpected_disconnect(&self) {
        use switchboard_metrics::{connections, counter, labels};
        counter!(
            connections::UNEXPECTED_DISCONNECTS_TOTAL,
            labels::INSTANCE => self.instance_id.clone()
        )
        .increment(1);
    }

    fn on_message_received(&self) {
        use switchboard_metrics::{counter, labels, messages};
        counter!(messages::RECEIVED_TOTAL, labels::INSTANCE => self.instance_id.clone())
            .increment(1);
    }

    fn on_message_delivered(&self) {
        use switchboard_metrics::{counter, labels, messages};
        counter!(messages::DELIVERED_TOTAL, labels::INSTANCE => self.instance_id.clone())
            .increment(1);
    }

    fn on_latency_report(&self, latency_ms: f64) {
        use switchboard_metrics::{histogram, labels, messages};
        histogram!(messages::CLIENT_LATENCY_MS, labels::INSTANCE => self.instance_id.clone())
            .record(latency_ms);
    }
}
