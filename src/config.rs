//! Recorder configuration, stored as JSON under the user config directory.

use crate::recorder::ScreenRecordingSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("No user config directory on this system")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Folder name used in the default output path.
    pub app_name: String,
    pub ffmpeg_path: Option<PathBuf>,
    /// Directory searched for a bundled ffmpeg before the system locations.
    pub tools_dir: Option<PathBuf>,
    pub stop_grace_period_ms: u64,
    pub default_settings: ScreenRecordingSettings,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            app_name: "ScreenRec".to_string(),
            ffmpeg_path: None,
            tools_dir: None,
            stop_grace_period_ms: 5000,
            default_settings: ScreenRecordingSettings::default(),
        }
    }
}

impl RecorderConfig {
    /// `<config_dir>/screenrec/config.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|d| d.join("screenrec").join("config.json"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!(target: "screenrec::config", "No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!(target: "screenrec::config", "Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(&Self::default_path()?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, text).map_err(io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::VideoCodec;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecorderConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, RecorderConfig::default());
        assert_eq!(config.stop_grace_period_ms, 5000);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"app_name": "Capture", "default_settings": {"fps": 15}}"#).unwrap();

        let config = RecorderConfig::load(&path).unwrap();
        assert_eq!(config.app_name, "Capture");
        assert_eq!(config.default_settings.fps, 15);
        assert_eq!(config.default_settings.codec, VideoCodec::H264);
        assert_eq!(config.ffmpeg_path, None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let config = RecorderConfig {
            ffmpeg_path: Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg")),
            stop_grace_period_ms: 1500,
            ..RecorderConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RecorderConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(RecorderConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
