//! Health projection for external observers.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::PathBuf;

/// Capture loop lifecycle phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    #[default]
    Stopped,
    Starting,
    CameraOpen,
    RecoveringFromReadFailure,
    Stopping,
}

/// Status fields written by the capture loop and the service controls.
#[derive(Clone, Debug, Default)]
pub(crate) struct LoopStatus {
    pub phase: LoopPhase,
    pub text: String,
    pub camera_opened: bool,
    pub backend: String,
    pub last_error: String,
    pub error_count: u64,
}

impl LoopStatus {
    pub fn stopped() -> Self {
        Self {
            text: "stopped".to_string(),
            ..Self::default()
        }
    }

    /// Record a failure: updates the text, stores the error and bumps the counter.
    pub fn fail(&mut self, phase: LoopPhase, text: &str, error: impl Into<String>) {
        self.phase = phase;
        self.text = text.to_string();
        self.last_error = error.into();
        self.error_count += 1;
    }
}

/// Recorder bookkeeping mirrored into shared state after every `record` call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentInfo {
    pub video_path: PathBuf,
    pub frame_log_path: PathBuf,
    pub written_frames: u64,
}

/// Read-only snapshot of service health.
///
/// Computed on demand; building one never waits for a frame.
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub phase: LoopPhase,
    pub camera_opened: bool,
    pub backend: String,
    pub status: String,
    pub last_error: String,
    pub error_count: u64,
    pub latest_sequence: u64,
    pub latest_frame_at: Option<DateTime<Local>>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub stream_fps: u32,
    pub recording_enabled: bool,
    pub recording_active: bool,
    pub current_record_path: Option<PathBuf>,
    pub current_frame_log_path: Option<PathBuf>,
    pub current_written_frames: u64,
    pub record_fps: u32,
    pub record_segment_seconds: u64,
    pub record_output_dir: PathBuf,
    pub record_max_storage_bytes: u64,
    pub stored_files: u64,
    pub stored_bytes: u64,
}
