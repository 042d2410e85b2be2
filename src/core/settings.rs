//! Persisted configuration
//!
//! Persisted to `<config dir>/Discwright/settings.json`. Every field has a
//! serde default so older or hand-edited files keep loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::burning::VerificationLevel;
use crate::error::{DiscError, Result};

/// Settings for burn sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurnSettings {
    /// Client tag handed to the recorder session
    pub client_name: String,
    /// Read-back verification after the write
    pub verification: VerificationLevel,
    /// Turn off buffer-underrun protection (kept on unless set here)
    pub buffer_underrun_free_disabled: bool,
    /// External burner program used by the Linux recorder backend
    pub recorder_program: String,
}

impl Default for BurnSettings {
    fn default() -> Self {
        Self {
            client_name: "Discwright".to_string(),
            verification: VerificationLevel::Full,
            buffer_underrun_free_disabled: false,
            recorder_program: "wodim".to_string(),
        }
    }
}

/// Settings for image builds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    pub default_volume_label: String,
    /// Where the front-end puts images when no output path is given
    pub output_directory: Option<PathBuf>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            default_volume_label: "DATA".to_string(),
            output_directory: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub burn: BurnSettings,
    pub image: ImageSettings,
}

impl Settings {
    const SETTINGS_FILE: &'static str = "settings.json";

    /// Get the app config directory
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("Discwright"))
    }

    /// Default settings file location
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join(Self::SETTINGS_FILE))
    }

    /// Load settings from disk, or return defaults if not found
    pub fn load() -> Self {
        let loaded = match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Err(DiscError::NotFound("config directory".to_string())),
        };

        match loaded {
            Ok(settings) => {
                log::debug!("Loaded settings from disk");
                settings
            }
            Err(e) => {
                log::debug!("Using default settings: {}", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| DiscError::from_io_at(e, path))?;

        serde_json::from_str(&contents).map_err(|e| {
            DiscError::InvalidArgument(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()
            .ok_or_else(|| DiscError::NotFound("config directory".to_string()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| {
            DiscError::InvalidArgument(format!("Failed to serialize settings: {}", e))
        })?;
        std::fs::write(path, json)?;

        log::debug!("Saved settings to {:?}", path);
        Ok(())
    }
}
