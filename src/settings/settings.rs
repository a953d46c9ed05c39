// Settings management and persistence
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{PlaybackError, Result};

/// Bytes moved from decoder to sink per loop iteration
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Output device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub buffer_ms: u32, // ring buffer length, 20-2000ms
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self { buffer_ms: 250 }
    }
}

/// Playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    pub version: i32, // Settings schema version for future migrations
    pub chunk_size: usize,
    pub output: OutputSettings,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            version: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            output: OutputSettings::default(),
        }
    }
}

impl PlaybackSettings {
    /// Get the settings file path
    pub fn settings_path(dir: &Path) -> PathBuf {
        dir.join("settings.json")
    }

    /// Load settings from file, or return defaults if file doesn't exist
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::settings_path(dir);

        if !path.exists() {
            debug!(?path, "no settings file found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| PlaybackError::Settings(format!("Failed to read settings file: {}", e)))?;

        let settings: PlaybackSettings = serde_json::from_str(&content)
            .map_err(|e| PlaybackError::Settings(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;

        debug!(?path, "loaded settings");
        Ok(settings)
    }

    /// Save settings to file
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| {
            PlaybackError::Settings(format!("Failed to create settings directory: {}", e))
        })?;

        let path = Self::settings_path(dir);
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| PlaybackError::Settings(format!("Failed to serialize settings: {}", e)))?;

        fs::write(&path, content)
            .map_err(|e| PlaybackError::Settings(format!("Failed to write settings file: {}", e)))?;

        debug!(?path, "saved settings");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(PlaybackError::Config("chunk_size must be at least 1".to_string()));
        }
        Ok(())
    }
}
