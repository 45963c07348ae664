//! Active capture settings snapshot.
//!
//! `Settings` is an immutable value: the service keeps one active snapshot and
//! only restarts the capture loop when a new snapshot compares unequal.

use std::path::PathBuf;
use std::time::Duration;

/// Codec tag that is always available (in-process Motion-JPEG).
pub const FALLBACK_CODEC: &str = "mjpg";

/// Right-angle rotation applied after resizing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Half,
    Clockwise270,
}

impl Rotation {
    /// Map a degree value onto a right-angle rotation.
    ///
    /// Returns `None` for anything that is not a multiple of 90.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::None),
            90 => Some(Self::Clockwise90),
            180 => Some(Self::Half),
            270 => Some(Self::Clockwise270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Clockwise90 => 90,
            Self::Half => 180,
            Self::Clockwise270 => 270,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Device identifier (`auto`, `rpicam`, `csi`, `/dev/video0`, `0`, `stub://...`).
    pub device: String,
    pub rotation: Rotation,
    pub frame_width: u32,
    pub frame_height: u32,
    pub capture_fps: u32,
    /// Maximum rate at which the live preview JPEG is re-encoded.
    pub stream_fps: u32,
    pub record_enabled: bool,
    pub record_fps: u32,
    pub segment_duration: Duration,
    pub output_dir: PathBuf,
    /// Four-character codec tag (`mp4v`, `avc1`, `mjpg`, ...).
    pub codec: String,
    /// Storage quota for recorded segments in bytes. Zero disables pruning.
    pub max_storage_bytes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device: "rpicam".to_string(),
            rotation: Rotation::None,
            frame_width: 1280,
            frame_height: 720,
            capture_fps: 30,
            stream_fps: 10,
            record_enabled: true,
            record_fps: 10,
            segment_duration: Duration::from_secs(300),
            output_dir: PathBuf::from("./captures/real_loop"),
            codec: "mp4v".to_string(),
            max_storage_bytes: gb_to_bytes(2.0),
        }
    }
}

impl Settings {
    /// Minimum spacing between live-preview encodes.
    pub fn stream_interval(&self) -> Duration {
        interval_for(self.stream_fps)
    }

    /// Minimum spacing between frames written to a segment.
    pub fn record_interval(&self) -> Duration {
        interval_for(self.record_fps)
    }

    /// Record rate used for nominal video time; never zero.
    pub fn effective_record_fps(&self) -> u32 {
        self.record_fps.max(1)
    }
}

fn interval_for(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(fps.max(1)))
}

/// Convert a gigabyte quota into bytes (1 GB = 1024^3 bytes). Negative values clamp to zero.
pub fn gb_to_bytes(gb: f64) -> u64 {
    (gb.max(0.0) * 1024.0 * 1024.0 * 1024.0) as u64
}

/// Truncate or pad a codec tag to exactly four characters.
pub fn normalize_codec_tag(raw: &str) -> String {
    let trimmed = raw.trim();
    let base = if trimmed.is_empty() { "mp4v" } else { trimmed };
    let mut tag: String = base.chars().take(4).collect();
    while tag.chars().count() < 4 {
        tag.push('v');
    }
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_accepts_only_right_angles() {
        assert_eq!(Rotation::from_degrees(0), Some(Rotation::None));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Clockwise90));
        assert_eq!(Rotation::from_degrees(-90), Some(Rotation::Clockwise270));
        assert_eq!(Rotation::from_degrees(45), None);
    }

    #[test]
    fn settings_compare_by_value() {
        let a = Settings::default();
        let mut b = a.clone();
        assert_eq!(a, b);
        b.stream_fps = 5;
        assert_ne!(a, b);
    }

    #[test]
    fn codec_tag_is_four_chars() {
        assert_eq!(normalize_codec_tag("h264x"), "h264");
        assert_eq!(normalize_codec_tag("mp"), "mpvv");
        assert_eq!(normalize_codec_tag(""), "mp4v");
    }

    #[test]
    fn intervals_never_divide_by_zero() {
        let settings = Settings {
            record_fps: 0,
            ..Settings::default()
        };
        assert_eq!(settings.record_interval(), Duration::from_secs(1));
        assert_eq!(settings.effective_record_fps(), 1);
    }
}
