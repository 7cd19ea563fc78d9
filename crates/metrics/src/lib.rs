//! Metric names recorded by switchboard instances.
//!
//! Recording goes through the [`metrics`] facade, so every call is a no-op
//! until the embedding process installs a recorder. Exporting is left to that
//! process.

pub use metrics::{counter, gauge, histogram};

/// Connection lifecycle.
pub mod connections {
    /// Currently open WebSocket connections on this instance (gauge).
    pub const ACTIVE: &str = "switchboard_connections_active";
    /// Connections accepted and registered (counter).
    pub const OPENED_TOTAL: &str = "switchboard_connections_opened_total";
    /// Connections ending without a normal/going-away close (counter).
    pub const UNEXPECTED_DISCONNECTS_TOTAL: &str = "switchboard_unexpected_disconnects_total";
}

/// Message flow.
pub mod messages {
    /// Envelopes decoded from client frames (counter).
    pub const RECEIVED_TOTAL: &str = "switchboard_messages_received_total";
    /// Envelopes written to a local socket by the relay (counter).
    pub const DELIVERED_TOTAL: &str = "switchboard_messages_delivered_total";
    /// Client-reported round-trip latency in milliseconds (histogram).
    pub const CLIENT_LATENCY_MS: &str = "switchboard_client_latency_ms";
}

/// Common label keys.
pub mod labels {
    pub const INSTANCE: &str = "instance";
}
