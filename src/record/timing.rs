//! Per-segment timing bookkeeping.
//!
//! Each written frame gets a nominal video time (`index / record_fps`) and a
//! wall-clock elapsed time since the first written frame. Their difference is
//! the sync error; the segment summary reports drift over the whole segment.

use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Drift bound (ms) for a segment to count as time-matched.
pub const MAX_MATCHED_DRIFT_MS: f64 = 300.0;
/// Per-frame sync error bound (ms) for a segment to count as time-matched.
pub const MAX_MATCHED_SYNC_ERROR_MS: f64 = 350.0;

/// One line of the `*.frames.jsonl` sidecar.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameTiming {
    pub frame_index: u64,
    pub captured_at: String,
    pub video_time_s: f64,
    pub elapsed_s: f64,
    pub sync_error_ms: f64,
}

/// Segment summary written to `*.meta.json` and the manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub video_path: PathBuf,
    pub frame_log_path: PathBuf,
    pub codec: String,
    pub record_fps: u32,
    pub opened_at: String,
    pub first_frame_at: String,
    pub last_frame_at: String,
    pub closed_at: String,
    pub written_frames: u64,
    pub timeline_elapsed_s: f64,
    pub expected_elapsed_s: f64,
    pub timeline_drift_ms: f64,
    pub avg_abs_sync_error_ms: f64,
    pub max_abs_sync_error_ms: f64,
    pub frame_time_matched: bool,
}

#[derive(Clone, Debug)]
pub struct SegmentTimeline {
    record_fps: u32,
    opened_at: DateTime<Local>,
    first_frame_at: Option<DateTime<Local>>,
    last_frame_at: Option<DateTime<Local>>,
    written_frames: u64,
    abs_error_sum_ms: f64,
    abs_error_max_ms: f64,
}

impl SegmentTimeline {
    pub fn new(record_fps: u32, opened_at: DateTime<Local>) -> Self {
        Self {
            record_fps: record_fps.max(1),
            opened_at,
            first_frame_at: None,
            last_frame_at: None,
            written_frames: 0,
            abs_error_sum_ms: 0.0,
            abs_error_max_ms: 0.0,
        }
    }

    pub fn written_frames(&self) -> u64 {
        self.written_frames
    }

    /// Account for one written frame and return its sidecar line.
    pub fn push(&mut self, captured_at: DateTime<Local>) -> FrameTiming {
        let frame_index = self.written_frames;
        let first = *self.first_frame_at.get_or_insert(captured_at);
        self.last_frame_at = Some(captured_at);

        let video_time_s = frame_index as f64 / f64::from(self.record_fps);
        let elapsed_s = seconds_between(first, captured_at);
        let error_ms = (elapsed_s - video_time_s) * 1000.0;
        self.abs_error_sum_ms += error_ms.abs();
        self.abs_error_max_ms = self.abs_error_max_ms.max(error_ms.abs());
        self.written_frames += 1;

        FrameTiming {
            frame_index,
            captured_at: timestamp(captured_at),
            video_time_s: round_to(video_time_s, 6),
            elapsed_s: round_to(elapsed_s, 6),
            sync_error_ms: round_to(error_ms, 3),
        }
    }

    pub fn summarize(
        &self,
        video_path: &Path,
        frame_log_path: &Path,
        codec: &str,
        closed_at: DateTime<Local>,
    ) -> SegmentMeta {
        let n = self.written_frames;
        let elapsed_s = match (self.first_frame_at, self.last_frame_at) {
            (Some(first), Some(last)) => seconds_between(first, last),
            _ => 0.0,
        };
        let expected_elapsed_s = if n > 0 {
            (n - 1) as f64 / f64::from(self.record_fps)
        } else {
            0.0
        };
        let drift_ms = (elapsed_s - expected_elapsed_s) * 1000.0;
        let avg_abs_ms = if n > 0 {
            self.abs_error_sum_ms / n as f64
        } else {
            0.0
        };

        SegmentMeta {
            video_path: video_path.to_path_buf(),
            frame_log_path: frame_log_path.to_path_buf(),
            codec: codec.to_string(),
            record_fps: self.record_fps,
            opened_at: timestamp(self.opened_at),
            first_frame_at: self.first_frame_at.map(timestamp).unwrap_or_default(),
            last_frame_at: self.last_frame_at.map(timestamp).unwrap_or_default(),
            closed_at: timestamp(closed_at),
            written_frames: n,
            timeline_elapsed_s: round_to(elapsed_s, 6),
            expected_elapsed_s: round_to(expected_elapsed_s, 6),
            timeline_drift_ms: round_to(drift_ms, 3),
            avg_abs_sync_error_ms: round_to(avg_abs_ms, 3),
            max_abs_sync_error_ms: round_to(self.abs_error_max_ms, 3),
            frame_time_matched: drift_ms.abs() <= MAX_MATCHED_DRIFT_MS
                && self.abs_error_max_ms <= MAX_MATCHED_SYNC_ERROR_MS,
        }
    }
}

fn seconds_between(from: DateTime<Local>, to: DateTime<Local>) -> f64 {
    let micros = (to - from).num_microseconds().unwrap_or(i64::MAX);
    (micros as f64 / 1_000_000.0).max(0.0)
}

/// Local ISO-8601 timestamp with millisecond precision.
pub fn timestamp(at: DateTime<Local>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, false)
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}
