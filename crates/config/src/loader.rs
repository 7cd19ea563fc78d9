use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::SwitchboardConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "switchboard.toml",
    "switchboard.yaml",
    "switchboard.yml",
    "switchboard.json",
];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Restrict discovery to `path`. Each call replaces the previous override.
pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./switchboard.{toml,yaml,yml,json}` (working directory)
/// 2. `~/.config/switchboard/switchboard.{toml,yaml,yml,json}`
///
/// Falls back to `SwitchboardConfig::default()` when nothing is found or the
/// file fails to parse.
pub fn discover_and_load() -> SwitchboardConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return SwitchboardConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            SwitchboardConfig::default()
        },
    }
}

/// Load `explicit` if given (errors are fatal), otherwise discover.
pub fn load_or_discover(explicit: Option<&Path>) -> anyhow::Result<SwitchboardConfig> {
    match explicit {
        Some(path) => load_config(path),
        None => Ok(discover_and_load()),
    }
}

/// Find the first config file in standard locations.
///
/// When a config dir override is set, only that directory is searched.
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return first_existing(&dir);
    }
    first_existing(Path::new(".")).or_else(|| config_dir().and_then(|d| first_existing(&d)))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory: override, or `~/.config/switchboard/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("switchboard"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
