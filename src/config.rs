use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::settings::{gb_to_bytes, normalize_codec_tag, Rotation, Settings};

const DEFAULT_DEVICE: &str = "rpicam";
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_CAPTURE_FPS: u32 = 30;
const DEFAULT_STREAM_FPS: u32 = 10;
const DEFAULT_RECORD_FPS: u32 = 10;
const DEFAULT_SEGMENT_SECS: u64 = 300;
const DEFAULT_OUTPUT_DIR: &str = "./captures/real_loop";
const DEFAULT_CODEC: &str = "mp4v";
const DEFAULT_MAX_STORAGE_GB: f64 = 2.0;

const MAX_OUTPUT_FPS: u32 = 30;
const MAX_SEGMENT_SECS: u64 = 3600;
const MAX_STORAGE_GB: f64 = 256.0;

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    camera: Option<CameraConfigFile>,
    stream: Option<StreamConfigFile>,
    record: Option<RecordConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    rotation: Option<i32>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordConfigFile {
    enabled: Option<bool>,
    fps: Option<u32>,
    segment_seconds: Option<u64>,
    output_dir: Option<PathBuf>,
    codec: Option<String>,
    max_storage_gb: Option<f64>,
}

/// Daemon configuration as loaded from file and environment.
///
/// Unlike `Settings` this keeps the operator-facing units (degrees, seconds,
/// gigabytes) so validation errors name what the operator wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub device: String,
    pub rotation_degrees: i32,
    pub width: u32,
    pub height: u32,
    pub capture_fps: u32,
    pub stream_fps: u32,
    pub record_enabled: bool,
    pub record_fps: u32,
    pub segment_seconds: u64,
    pub output_dir: PathBuf,
    pub codec: String,
    pub max_storage_gb: f64,
}

impl CaptureConfig {
    /// Load from `CAGE_CONFIG` (if set), then apply `CAGE_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAGE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load an explicit file. Environment overrides still apply.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn settings(&self) -> Result<Settings> {
        let rotation = Rotation::from_degrees(self.rotation_degrees).ok_or_else(|| {
            anyhow!("rotation must be one of 0/90/180/270 (got {})", self.rotation_degrees)
        })?;
        Ok(Settings {
            device: self.device.clone(),
            rotation,
            frame_width: self.width,
            frame_height: self.height,
            capture_fps: self.capture_fps,
            stream_fps: self.stream_fps,
            record_enabled: self.record_enabled,
            record_fps: self.record_fps,
            segment_duration: Duration::from_secs(self.segment_seconds),
            output_dir: self.output_dir.clone(),
            codec: normalize_codec_tag(&self.codec),
            max_storage_bytes: gb_to_bytes(self.max_storage_gb),
        })
    }

    fn from_file(file: CaptureConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let record = file.record.unwrap_or_default();
        Self {
            device: camera.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            rotation_degrees: camera.rotation.unwrap_or(0),
            width: camera.width.unwrap_or(DEFAULT_WIDTH),
            height: camera.height.unwrap_or(DEFAULT_HEIGHT),
            capture_fps: camera.fps.unwrap_or(DEFAULT_CAPTURE_FPS),
            stream_fps: stream.fps.unwrap_or(DEFAULT_STREAM_FPS),
            record_enabled: record.enabled.unwrap_or(true),
            record_fps: record.fps.unwrap_or(DEFAULT_RECORD_FPS),
            segment_seconds: record.segment_seconds.unwrap_or(DEFAULT_SEGMENT_SECS),
            output_dir: record
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            codec: record.codec.unwrap_or_else(|| DEFAULT_CODEC.to_string()),
            max_storage_gb: record.max_storage_gb.unwrap_or(DEFAULT_MAX_STORAGE_GB),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("CAGE_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device.trim().to_string();
            }
        }
        if let Ok(rotation) = std::env::var("CAGE_ROTATION") {
            self.rotation_degrees = rotation
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAGE_ROTATION must be an integer number of degrees"))?;
        }
        if let Ok(enabled) = std::env::var("CAGE_RECORD_ENABLED") {
            self.record_enabled = parse_bool(&enabled)
                .ok_or_else(|| anyhow!("CAGE_RECORD_ENABLED must be true/false"))?;
        }
        if let Ok(dir) = std::env::var("CAGE_RECORD_DIR") {
            if !dir.trim().is_empty() {
                self.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(gb) = std::env::var("CAGE_MAX_STORAGE_GB") {
            self.max_storage_gb = gb
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAGE_MAX_STORAGE_GB must be a number of gigabytes"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.device = self.device.trim().to_string();
        if self.device.is_empty() {
            self.device = DEFAULT_DEVICE.to_string();
        }
        self.rotation_degrees = self.rotation_degrees.rem_euclid(360);
        if Rotation::from_degrees(self.rotation_degrees).is_none() {
            bail!(
                "rotation must be one of 0/90/180/270 (got {})",
                self.rotation_degrees
            );
        }
        if self.width == 0 || self.height == 0 {
            bail!("frame size must be at least 1x1");
        }
        if self.capture_fps == 0 {
            bail!("camera fps must be at least 1");
        }
        for (name, fps) in [("stream", self.stream_fps), ("record", self.record_fps)] {
            if fps == 0 || fps > MAX_OUTPUT_FPS {
                bail!("{} fps must be between 1 and {}", name, MAX_OUTPUT_FPS);
            }
        }
        if self.segment_seconds == 0 || self.segment_seconds > MAX_SEGMENT_SECS {
            bail!("segment_seconds must be between 1 and {}", MAX_SEGMENT_SECS);
        }
        if !self.max_storage_gb.is_finite()
            || self.max_storage_gb < 0.0
            || self.max_storage_gb > MAX_STORAGE_GB
        {
            bail!("max_storage_gb must be between 0 and {}", MAX_STORAGE_GB);
        }
        self.codec = normalize_codec_tag(&self.codec);
        Ok(())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::from_file(CaptureConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
