//! On-disk pipeline configuration (§3.1): a small `serde`/TOML struct tree
//! loaded once at startup and then overridden field-by-field by CLI flags.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppError, Result};

/// Top-level configuration, loaded from TOML with every field defaulted so a
/// partial or missing file is never an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub capture: CaptureConfig,
    pub encoder: EncoderTuning,
    pub stage_queue_depth: usize,
    pub rtp: RtpConfig,
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            encoder: EncoderTuning::default(),
            stage_queue_depth: 4,
            rtp: RtpConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Reads `path` as TOML, falling back to [`PipelineConfig::default`] when
    /// the file doesn't exist. A file that exists but fails to parse is an
    /// error: a typo in a config file should not silently run with defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                toml::from_str(&contents).map_err(|e| AppError::Config(format!("{}: {e}", path.display())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(AppError::Io(e)),
        }
    }
}

/// Capture device settings (mirrors [`crate::video::capture::CaptureConfig`]
/// field-for-field; kept separate since this one is the serializable,
/// user-facing shape and the video-module one carries resolved types like
/// `PathBuf`/`PixelFormat`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { device: "/dev/video0".to_string(), width: 1920, height: 1080, fps: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderTuning {
    pub target_kbps: u32,
    pub framerate: u32,
    pub gop_size: u32,
}

impl Default for EncoderTuning {
    fn default() -> Self {
        Self { target_kbps: 4000, framerate: 30, gop_size: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RtpConfig {
    pub mtu: usize,
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self { mtu: 1200 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = PipelineConfig::load("/nonexistent/path/does-not-exist.toml").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn partial_toml_fills_in_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "log_level = \"debug\"\n\n[capture]\nwidth = 1280\nheight = 720\n").unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.capture.width, 1280);
        assert_eq!(config.capture.height, 720);
        assert_eq!(config.capture.fps, 30);
        assert_eq!(config.encoder, EncoderTuning::default());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();

        assert!(PipelineConfig::load(&path).is_err());
    }
}
