//! Persistent daemon settings

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pam_ctl::PamConfig;
use pam_sim::VirtualPamConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Daemon settings, stored as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Controller configuration
    pub pam: PamConfig,
    /// Run against an in-process virtual controller instead of a serial port
    pub simulate: bool,
    /// Virtual controller used when `simulate` is set
    pub simulator: VirtualPamConfig,
    /// Seconds between status summaries in the log (0 disables)
    pub status_log_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pam: PamConfig::default(),
            simulate: false,
            simulator: VirtualPamConfig::default(),
            status_log_interval_secs: 30,
        }
    }
}

impl Settings {
    /// Get the XDG config directory for pamd
    /// Uses $XDG_CONFIG_HOME/pamd, falls back to ~/.config/pamd
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("pamd"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("pamd"))
    }

    /// Default settings file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from a file
    ///
    /// A missing file yields defaults; an unreadable one is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("invalid settings in {}", path.display()))
    }

    /// Load settings from the default location, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        Self::load_from(&path).unwrap_or_else(|e| {
            warn!("{:#}; using defaults", e);
            Self::default()
        })
    }

    /// Save settings to a file, creating its directory if needed
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("pamd-test-{}-{}", std::process::id(), name))
            .join("settings.json")
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = scratch_path("missing");
        assert_eq!(Settings::load_from(&path).unwrap(), Settings::default());
    }

    #[test]
    fn test_save_and_load() {
        let path = scratch_path("roundtrip");
        let mut settings = Settings::default();
        settings.simulate = true;
        settings.pam.link.port = "/dev/ttyS3".to_string();
        settings.simulator.function = 196;

        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_partial_settings() {
        let settings: Settings =
            serde_json::from_str(r#"{ "simulate": true, "pam": { "processor": { "response_timeout_ms": 9000 } } }"#)
                .unwrap();
        assert!(settings.simulate);
        assert_eq!(settings.pam.processor.response_timeout_ms, 9000);
        assert_eq!(settings.pam.processor.queue_capacity, 50);
        assert_eq!(settings.pam.link.baud_rate, 57600);
        assert_eq!(settings.status_log_interval_secs, 30);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let path = scratch_path("invalid");
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Settings::load_from(&path).is_err());

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
