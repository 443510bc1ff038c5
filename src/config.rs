use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::media::MediaConfig;
use crate::webrtc::{PeerId, RtcConfig, SignallingConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signalling: SignallingConfig,
    #[serde(default)]
    pub webrtc: RtcConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

impl Config {
    /// Load config from `path`, writing the defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    /// Configured identity, or a fresh one for this run
    pub fn local_id(&self) -> PeerId {
        match &self.signalling.local_id {
            Some(id) if !id.trim().is_empty() => PeerId::new(id.trim()),
            _ => PeerId::generate(),
        }
    }
}

/// Get the toolbox directory (~/.toolbox-rtc)
pub fn get_toolbox_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolbox-rtc")
}

/// Get the config file path (~/.toolbox-rtc/config.toml)
pub fn get_config_path() -> PathBuf {
    get_toolbox_dir().join("config.toml")
}
