//! Camera backends.
//!
//! Every way of acquiring frames implements `CameraBackend`:
//! - `RpicamBackend`: spawns `rpicam-vid`/`libcamera-vid` and parses MJPEG from its stdout
//! - `LibcameraBackend`: vendor camera stack through GStreamer `libcamerasrc`
//! - `V4l2Backend`: generic frame grabber on a V4L2 device node
//! - `StubBackend`: synthetic frames for `stub://` identifiers (tests, demos)
//!
//! Backends are owned exclusively by the capture loop thread. `select_backend`
//! walks an ordered candidate list and returns the first backend that opens.

use anyhow::Result;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::frame::Frame;

pub mod libcamera;
pub mod mjpeg;
pub mod normalize;
pub mod rpicam;
pub mod select;
pub mod stub;
pub mod v4l2;

pub use libcamera::LibcameraBackend;
pub use normalize::normalize_frame;
pub use rpicam::RpicamBackend;
pub use select::{candidates_for, select_backend, Candidate, Selected};
pub use stub::{StubBackend, StubOptions};
pub use v4l2::V4l2Backend;

/// A camera acquisition strategy.
pub trait CameraBackend: Send {
    /// Human-readable backend identifier (shown in status).
    fn name(&self) -> &str;

    /// Acquire the device. Called once by the selector before any `read`.
    fn open(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    ///
    /// Implementations bound the wait with their own I/O timeout and return an
    /// error when the source stopped producing frames.
    fn read(&mut self) -> Result<Frame>;

    /// Hand the backend the loop's stop flag. Backends whose `read` can wait
    /// across several poll windows check it between windows and fail early.
    fn watch_stop(&mut self, _stop: Arc<AtomicBool>) {}

    /// Release the device. Must be safe to call more than once.
    fn close(&mut self);
}

