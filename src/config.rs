/// Persisted application settings
///
/// Stored as pretty JSON at `<config dir>/print-order/settings.json`.
/// A missing file means defaults.
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ConfigError;

/// Sub-folder of the user config directory
const APP_DIR: &str = "print-order";
/// File name inside the app directory
const SETTINGS_FILE: &str = "settings.json";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Everything remembered between runs
pub struct Settings {
    /// Folder holding one sub-directory per order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,
    /// Number of the most recently created order
    #[serde(default)]
    pub last_order_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Folder the `watch` command follows when none is given
    pub watch_folder: Option<PathBuf>,
}

impl Settings {
    /// Default settings location for the current user
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push(APP_DIR);
        path.push(SETTINGS_FILE);
        Ok(path)
    }

    /// Read settings from `path`; a missing file gives defaults
    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write settings as pretty JSON, creating the parent folder
    pub async fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Whole file is rewritten on every save
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("settings.json")).await.unwrap();
        // First run: no base dir, counter at zero
        assert_eq!(settings, Settings::default());
    }

    #[tokio::test]
    async fn test_save_creates_parent_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = Settings {
            base_dir: Some(PathBuf::from("/srv/orders")),
            last_order_number: 41,
            watch_folder: Some(PathBuf::from("/srv/inbox")),
        };
        // Parent folder does not exist yet
        settings.save_to(&path).await.unwrap();

        // camelCase keys, as other tools read this file too
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"lastOrderNumber\": 41"));
        assert!(raw.contains("\"watchFolder\": \"/srv/inbox\""));
        assert_eq!(Settings::load_from(&path).await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Settings::load_from(&path).await, Err(ConfigError::Json(_))));
    }
}
