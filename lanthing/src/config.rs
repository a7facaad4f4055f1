//! Persisted user settings.
//!
//! A TOML file under the platform config dir
//! (`<config>/lanthing/settings.toml`); every section has defaults and a
//! broken file falls back to them with a warning rather than refusing to
//! start.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use lanthing_core::negotiate::DisplaySetting;
use lanthing_core::types::VideoCodec;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub signaling: SignalingConfig,
    pub client: ClientConfig,
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Requested stream width.
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    /// Codec preference, most preferred first (`avc`, `hevc`).
    pub codecs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Pipe endpoint workers connect to.
    pub pipe_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace` / `debug` / `info` / `warn` / `error`.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".into(),
            port: 8788,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            refresh_hz: 60,
            codecs: vec!["avc".into(), "hevc".into()],
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pipe_name: "lanthing-service".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Paths & loading ──────────────────────────────────────────────

/// `<platform config dir>/lanthing`, falling back to the working
/// directory when the platform gives us nothing.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|base| base.join("lanthing"))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn settings_path() -> PathBuf {
    config_dir().join("settings.toml")
}

impl Settings {
    /// Load from `path`, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid settings {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Parse the configured codec preference, skipping unknown names.
    pub fn codec_preference(&self) -> Vec<VideoCodec> {
        self.client
            .codecs
            .iter()
            .filter_map(|name| VideoCodec::parse(name))
            .collect()
    }

    pub fn display(&self) -> DisplaySetting {
        DisplaySetting::new(
            self.client.width,
            self.client.height,
            self.client.refresh_hz,
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_serialize_and_roundtrip() {
        let settings = Settings::default();
        let text = toml::to_string_pretty(&settings).unwrap();
        assert!(text.contains("pipe_name"));
        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed.signaling.port, 8788);
        assert_eq!(parsed.client.width, 1920);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: Settings = toml::from_str("[client]\nwidth = 1280\n").unwrap();
        assert_eq!(parsed.client.width, 1280);
        assert_eq!(parsed.client.height, 1080);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn codec_preference_skips_unknown() {
        let mut settings = Settings::default();
        settings.client.codecs = vec!["hevc".into(), "mystery".into(), "avc".into()];
        assert_eq!(
            settings.codec_preference(),
            vec![VideoCodec::H265, VideoCodec::H264]
        );
    }

    #[test]
    fn missing_file_uses_defaults() {
        let settings = Settings::load(Path::new("/definitely/not/here.toml"));
        assert_eq!(settings.service.pipe_name, "lanthing-service");
    }
}
