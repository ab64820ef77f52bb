//! Daemon runtime configuration.
//!
//! Loaded from `~/.plugin-sync/daemon.toml`. A missing file yields defaults; a
//! malformed file is reported to the caller, which falls back to defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 25;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_ENTITY_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub commands: CommandsSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DaemonSection {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_entity_ttl_secs")]
    pub entity_ttl_secs: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            entity_ttl_secs: DEFAULT_ENTITY_TTL_SECS,
        }
    }
}

/// Shell commands backing the external collaborators. Each runs under `sh -c`
/// with `PLUGIN_SYNC_REPOSITORY` set.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommandsSection {
    #[serde(default)]
    pub check: Option<String>,
    #[serde(default)]
    pub install: Option<String>,
    #[serde(default)]
    pub activate: Option<String>,
    #[serde(default)]
    pub deactivate: Option<String>,
    #[serde(default)]
    pub registry: Option<String>,
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}

fn default_reconcile_interval_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}

fn default_entity_ttl_secs() -> u64 {
    DEFAULT_ENTITY_TTL_SECS
}

pub fn default_config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".plugin-sync").join("daemon.toml"))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    parse_config_file(&config_path)
}

fn parse_config_file(path: &Path) -> Result<DaemonConfig, String> {
    let content = fs_err::read_to_string(path)
        .map_err(|err| format!("Failed to read config {}: {}", path.display(), err))?;
    let config = toml::from_str::<DaemonConfig>(&content)
        .map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))?;

    if config.daemon.heartbeat_interval_secs == 0 {
        return Err(format!(
            "Invalid config {}: heartbeat_interval_secs must be positive",
            path.display()
        ));
    }
    if config.daemon.lock_ttl_secs == 0 {
        return Err(format!(
            "Invalid config {}: lock_ttl_secs must be positive",
            path.display()
        ));
    }

    Ok(config)
}
