//! Configuration loading for switchboard instances.
//!
//! Config files (`switchboard.{toml,yaml,yml,json}`) support `${ENV}`
//! substitution. CLI flags and environment variables layered on top are the
//! binary's concern.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config, load_or_discover},
    schema::{PresenceConfig, RedisConfig, ServerConfig, SwitchboardConfig},
};
