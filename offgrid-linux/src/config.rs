//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use offgrid_core::DEFAULT_SERVICE_ID;
use serde::Deserialize;

use crate::transport::LanSettings;

/// Daemon configuration. File: ~/.config/offgrid/config.toml or /etc/offgrid/config.toml.
/// Env overrides: OFFGRID_SERVICE_ID, OFFGRID_USERNAME, OFFGRID_DISCOVERY_PORT, OFFGRID_LOG.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_service_id")]
    pub service_id: String,
    /// Display name; a random `User-NNNN` when unset.
    #[serde(default)]
    pub username: Option<String>,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_beacon_interval_secs")]
    pub beacon_interval_secs: u64,
    /// An advertiser unheard for this long is reported lost.
    #[serde(default = "default_endpoint_timeout_secs")]
    pub endpoint_timeout_secs: u64,
    /// tracing filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_service_id() -> String {
    DEFAULT_SERVICE_ID.to_owned()
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_beacon_interval_secs() -> u64 {
    2
}
fn default_endpoint_timeout_secs() -> u64 {
    8
}
fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            username: None,
            discovery_port: default_discovery_port(),
            beacon_interval_secs: default_beacon_interval_secs(),
            endpoint_timeout_secs: default_endpoint_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn lan_settings(&self) -> LanSettings {
        LanSettings {
            discovery_port: self.discovery_port,
            beacon_interval: Duration::from_secs(self.beacon_interval_secs.max(1)),
            endpoint_timeout: Duration::from_secs(self.endpoint_timeout_secs.max(1)),
        }
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("OFFGRID_SERVICE_ID").filter(|s| !s.is_empty()) {
            self.service_id = s;
        }
        if let Some(s) = var("OFFGRID_USERNAME").filter(|s| !s.is_empty()) {
            self.username = Some(s);
        }
        if let Some(p) = var("OFFGRID_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.discovery_port = p;
        }
        if let Some(s) = var("OFFGRID_LOG").filter(|s| !s.is_empty()) {
            self.log_level = s;
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/offgrid/config.toml"));
    }
    out.push(PathBuf::from("/etc/offgrid/config.toml"));
    out
}

/// First existing config file wins; a malformed one falls back to defaults.
fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let s = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            eprintln!("offgrid: ignoring {}: {}", path.display(), e);
            None
        }
    }
}
