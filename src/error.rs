use std::fmt;

use thiserror::Error;

/// Failure of a single backend candidate during selection.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("{candidate}: {reason}")]
pub struct OpenFailure {
    /// Candidate label (e.g. `rpicam-vid`, `libcamera`, `v4l2(/dev/video0)`).
    pub candidate: String,
    pub reason: String,
}

impl OpenFailure {
    pub fn new(candidate: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            candidate: candidate.into(),
            reason: reason.to_string(),
        }
    }
}

/// Every candidate backend failed to open.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("no available camera backend ({})", attempt_summary(.device, .attempts))]
pub struct BackendOpenError {
    pub device: String,
    pub attempts: Vec<OpenFailure>,
}

fn attempt_summary(device: &str, attempts: &[OpenFailure]) -> String {
    if attempts.is_empty() {
        return format!("device={}", device);
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the capture service.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    NoBackend(#[from] BackendOpenError),

    #[error("camera read failed [{backend}]: {reason}")]
    ReadFailed { backend: String, reason: String },

    #[error("recording open failed in {dir}: {reason}")]
    RecorderOpen { dir: String, reason: String },

    #[error("recording write failed for {path}: {reason}")]
    RecorderWrite { path: String, reason: String },

    #[error("failed to spawn capture thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("previous capture loop has not exited after {waited_ms} ms")]
    LoopStillRunning { waited_ms: u128 },
}
