use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Orchestrator configuration, loaded from `~/.config/odm/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory that receives one destination file per job, named by job id.
    pub download_dir: PathBuf,
    /// How often active workers are polled for a status snapshot.
    pub reconcile_interval_ms: u64,
    /// How long a status poll may wait before the worker is considered lost.
    pub status_timeout_ms: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    /// Bandwidth cap shared by all workers, in bytes per second (None = no cap).
    pub max_bytes_per_sec: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            reconcile_interval_ms: 1000,
            status_timeout_ms: 500,
            connect_timeout_secs: 30,
            user_agent: concat!("odm/", env!("CARGO_PKG_VERSION")).to_string(),
            max_bytes_per_sec: None,
        }
    }
}

impl ManagerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms.max(1))
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("odm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from the XDG config dir, creating a default file if none exists.
pub fn load_or_init() -> Result<ManagerConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = ManagerConfig::default();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(&default_cfg)?)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }
    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<ManagerConfig> {
    let data = fs::read_to_string(path)?;
    Ok(toml::from_str(&data)?)
}
