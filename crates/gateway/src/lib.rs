//! Gateway: WebSocket server, connection registry, presence and cross-instance
//! routing.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Connect the presence store, subscribe the relay to `server:{instance}`
//! 3. Start HTTP server (health, WebSocket upgrade)
//! 4. Per connection: register, heartbeat, read until close, tear down once
//! 5. On shutdown: stop the relay, tear down every local connection
//!
//! Delivery is at-most-once. Presence is eventually consistent: membership
//! sets may go stale and are repaired lazily by the sender.

pub mod heartbeat;
pub mod hooks;
pub mod memory_store;
pub mod presence;
pub mod reader;
pub mod redis_store;
pub mod registry;
pub mod relay;
pub mod sender;
pub mod server;
pub mod state;
pub mod ws;
