// Configuration management for the Attune CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/attune/config.json
// - Linux: ~/.config/attune/config.json
// - Windows: %APPDATA%\attune\config.json

use anyhow::{Context, Result};
use attune_core::{AdvertiseMode, PrivacyLevel, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage path for the node's sled database; `None` uses the data dir
    pub storage_path: Option<String>,

    /// Settings handed to the exchange service
    pub service: ServiceConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("attune");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("attune");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Where the node database lives
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("storage")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .service
                .validate()
                .context("Config file holds invalid service settings")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Set a config value in memory. The change is rejected if it leaves the
    /// service settings invalid.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        let svc = &mut next.service;
        match key {
            "storage_path" => {
                next.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "max_chunk" => svc.max_chunk = value.parse().context("Invalid number")?,
            "exchange_timeout_ms" => {
                svc.exchange_timeout_ms = value.parse().context("Invalid number")?
            }
            "backoff_ms" => svc.backoff_ms = value.parse().context("Invalid number")?,
            "scan_interval_ms" => {
                svc.scan.scan_interval_ms = value.parse().context("Invalid number")?
            }
            "duty_cycle_percent" => {
                svc.scan.duty_cycle_percent = if value == "auto" || value.is_empty() {
                    None
                } else {
                    let percent: u8 = value.parse().context("Invalid percentage")?;
                    if percent == 0 || percent > 100 {
                        anyhow::bail!("Duty cycle must be 1-100 or 'auto'");
                    }
                    Some(percent)
                };
            }
            "beacon_rotation_secs" => {
                svc.beacon_rotation_secs = value.parse().context("Invalid number")?
            }
            "advertise_mode" => {
                svc.advertise_mode = value
                    .parse::<AdvertiseMode>()
                    .map_err(anyhow::Error::msg)?
            }
            "privacy_level" => {
                svc.privacy_level = value
                    .parse::<PrivacyLevel>()
                    .map_err(anyhow::Error::msg)?
            }
            "reassembly_idle_ms" => {
                svc.reassembly_idle_ms = value.parse().context("Invalid number")?
            }
            "dedup_ttl_ms" => svc.dedup_ttl_ms = value.parse().context("Invalid number")?,
            "ack_capacity" => svc.ack_capacity = value.parse().context("Invalid number")?,
            "inbox_capacity" => svc.inbox_capacity = value.parse().context("Invalid number")?,
            "connection_capacity" => {
                svc.connection_capacity = value.parse().context("Invalid number")?
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        next.service.validate()?;
        *self = next;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let svc = &self.service;
        vec![
            (
                "storage_path".to_string(),
                self.storage_path
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("max_chunk".to_string(), svc.max_chunk.to_string()),
            (
                "exchange_timeout_ms".to_string(),
                svc.exchange_timeout_ms.to_string(),
            ),
            ("backoff_ms".to_string(), svc.backoff_ms.to_string()),
            (
                "scan_interval_ms".to_string(),
                svc.scan.scan_interval_ms.to_string(),
            ),
            (
                "duty_cycle_percent".to_string(),
                svc.scan
                    .duty_cycle_percent
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "auto".to_string()),
            ),
            (
                "beacon_rotation_secs".to_string(),
                svc.beacon_rotation_secs.to_string(),
            ),
            ("advertise_mode".to_string(), svc.advertise_mode.to_string()),
            ("privacy_level".to_string(), svc.privacy_level.to_string()),
            (
                "reassembly_idle_ms".to_string(),
                svc.reassembly_idle_ms.to_string(),
            ),
            ("dedup_ttl_ms".to_string(), svc.dedup_ttl_ms.to_string()),
            ("ack_capacity".to_string(), svc.ack_capacity.to_string()),
            ("inbox_capacity".to_string(), svc.inbox_capacity.to_string()),
            (
                "connection_capacity".to_string(),
                svc.connection_capacity.to_string(),
            ),
        ]
    }
}
