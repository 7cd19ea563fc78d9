//! Wire protocol shared by every switchboard instance.
//!
//! One JSON [`Envelope`] travels per WebSocket text frame and per pub/sub
//! message. The [`keys`] module names the presence keyspace and the
//! per-instance routing channels.

pub mod envelope;
pub mod keys;

pub use envelope::{Envelope, MessageType, ProtocolError};

/// Close codes a peer may use to end a session cleanly.
pub mod close_codes {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (tab closed, app backgrounded).
    pub const GOING_AWAY: u16 = 1001;

    pub fn is_clean(code: u16) -> bool {
        code == NORMAL || code == GOING_AWAY
    }
}
