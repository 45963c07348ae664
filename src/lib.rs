//! Enclosure camera capture service.
//!
//! Keeps a single camera open for as long as the process lives, publishes the
//! newest frame to any number of preview readers, and records the stream as
//! time-stamped video segments under a storage quota.
//!
//! # Architecture
//!
//! One capture thread owns the camera and the open segment. It runs
//! read → normalize → publish → record and recovers from failures on its own:
//!
//! 1. **Backend selection**: a device identifier expands into an ordered list of
//!    acquisition strategies; the first one that opens wins.
//! 2. **Latest frame wins**: readers always get the newest JPEG, never a backlog.
//! 3. **Time-accurate segments**: every written frame is logged with its sync
//!    error, and each closed segment reports its drift.
//! 4. **Bounded storage**: the oldest segments are evicted before a new one
//!    opens; the segment being written is never deleted.
//!
//! # Module Structure
//!
//! - `ingest`: camera backends, backend selection, MJPEG framing, normalization
//! - `publish`: latest-frame publisher and preview waits
//! - `record`: segmented recorder, encoders, timing sidecars, storage janitor
//! - `service`: capture loop thread and its start/stop/reconfigure controls
//! - `config`: daemon configuration loader producing `Settings`

pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod publish;
pub mod record;
pub mod service;
pub mod settings;
pub mod status;

mod shared;

pub use config::CaptureConfig;
pub use error::{BackendOpenError, CaptureError, OpenFailure};
pub use frame::Frame;
pub use ingest::CameraBackend;
pub use publish::PublishedFrame;
pub use record::{PruneReport, Recorder, SegmentMeta, MANIFEST_FILE};
pub use service::CaptureService;
pub use settings::{Rotation, Settings};
pub use status::{LoopPhase, SegmentInfo, StatusSnapshot};
