//! Persisted CLI configuration: local identity fields and the download
//! directory, stored as JSON under the per-user config dir.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Persisted settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Stable local device id, generated on first run
    pub device_id: String,
    /// Local display name
    pub device_name: String,
    /// Where delivered files land
    pub download_dir: PathBuf,
}

impl Config {
    /// Per-user configuration directory.
    pub fn default_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("no user configuration directory available")?
            .join("airlift"))
    }

    fn path(dir: &Path) -> PathBuf {
        dir.join("config.json")
    }

    /// Load the config from `dir`, creating and persisting defaults on first
    /// run or when the file is unreadable.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        if let Ok(bytes) = fs::read(&path) {
            match serde_json::from_slice(&bytes) {
                Ok(config) => return Ok(config),
                Err(e) => tracing::warn!("corrupt config {}, recreating: {e}", path.display()),
            }
        }

        let config = Self {
            device_id: generate_device_id(),
            device_name: default_device_name(),
            download_dir: dirs::download_dir()
                .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))),
        };
        config.save(dir)?;
        Ok(config)
    }

    /// Persist the config into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating config dir {}", dir.display()))?;
        let path = Self::path(dir);
        fs::write(&path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

fn generate_device_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "airlift-device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_run_creates_and_persists() {
        let tmp = TempDir::new().unwrap();
        let first = Config::load_or_create(tmp.path()).unwrap();
        assert_eq!(first.device_id.len(), 32);

        let second = Config::load_or_create(tmp.path()).unwrap();
        assert_eq!(first.device_id, second.device_id);
    }

    #[test]
    fn corrupt_config_is_recreated() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("config.json"), b"{oops").unwrap();
        let config = Config::load_or_create(tmp.path()).unwrap();
        assert!(!config.device_id.is_empty());
    }
}
