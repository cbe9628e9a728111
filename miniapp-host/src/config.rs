//! Load host config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use miniapp_core::CoreConfig;
use serde::Deserialize;
use tracing::{debug, warn};

/// Host configuration. File: $MINIAPP_CONFIG, ~/.config/miniapp/config.toml or
/// /etc/miniapp/config.toml. Env overrides: MINIAPP_APP_ROOT, MINIAPP_SDK_VERSION,
/// MINIAPP_HEARTBEAT_MS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Protocol timings and limits.
    #[serde(default)]
    pub core: CoreConfig,
    /// Root of the app store; archives extract to `<app_root>/<appId>/<etag>`.
    #[serde(default = "default_app_root")]
    pub app_root: PathBuf,
    /// Resolution of per-call timers (default 50 ms).
    #[serde(default = "default_worker_tick_ms")]
    pub worker_tick_ms: u64,
}

fn default_app_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/miniapp/apps"),
        None => PathBuf::from("/var/lib/miniapp/apps"),
    }
}
fn default_worker_tick_ms() -> u64 {
    50
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            app_root: default_app_root(),
            worker_tick_ms: default_worker_tick_ms(),
        }
    }
}

impl HostConfig {
    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<HostConfig> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => load_from(&p).with_context(|| format!("loading config {}", p.display()))?,
        None => HostConfig::default(),
    };
    apply_env(&mut c);
    Ok(c)
}

pub fn load_from(path: &Path) -> Result<HostConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let c = toml::from_str::<HostConfig>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "config loaded");
    Ok(c)
}

fn apply_env(c: &mut HostConfig) {
    if let Some(p) = std::env::var_os("MINIAPP_APP_ROOT") {
        c.app_root = PathBuf::from(p);
    }
    if let Ok(s) = std::env::var("MINIAPP_SDK_VERSION") {
        c.core.sdk_version = s;
    }
    if let Ok(s) = std::env::var("MINIAPP_HEARTBEAT_MS") {
        match s.parse::<u64>() {
            Ok(ms) => c.core.heartbeat_interval_ms = ms,
            Err(_) => warn!(value = %s, "ignoring invalid MINIAPP_HEARTBEAT_MS"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("MINIAPP_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/miniapp/config.toml"));
    }
    out.push(PathBuf::from("/etc/miniapp/config.toml"));
    out
}
