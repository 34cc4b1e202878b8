//! TOML configuration file loading
//!
//! Supports `~/.config/wakelink/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct WakelinkConfigFile {
    /// Remote endpoint configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Wake word configuration
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Session timing configuration
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Audio configuration
    #[serde(default)]
    pub audio: AudioFileConfig,
}

/// Remote endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    /// Use `wss://` instead of `ws://`
    pub secure: Option<bool>,
    pub connect_timeout_ms: Option<u64>,
    /// Connect as soon as permission is granted
    pub auto_connect: Option<bool>,
}

/// Wake word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Trigger phrase (e.g. "radha")
    pub phrase: Option<String>,
    /// Recognition model reference passed to the recognizer
    pub model: Option<String>,
    /// Streaming recognizer program
    pub recognizer: Option<String>,
    /// Extra arguments for the recognizer
    pub recognizer_args: Option<Vec<String>>,
    pub cooldown_ms: Option<u64>,
    pub trigger_on_partial: Option<bool>,
    pub partial_min_confidence: Option<f32>,
    pub listen_on_start: Option<bool>,
    pub event_buffer: Option<usize>,
}

/// Session timing configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub auto_capture_ms: Option<u64>,
    pub rearm_quiet_ms: Option<u64>,
    pub max_manual_capture_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
}

/// Audio configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    /// "bell" or "none"
    pub feedback: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `WakelinkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> WakelinkConfigFile {
    config_file_path().map_or_else(WakelinkConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> WakelinkConfigFile {
    if !path.exists() {
        return WakelinkConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                WakelinkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            WakelinkConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/wakelink/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("wakelink").join("config.toml"))
}
