//! Segmented recorder.
//!
//! The recorder is owned by the capture thread. Per segment it produces:
//! - the video file (`loop_<timestamp>.mp4` or `.mjpeg`),
//! - `<video>.frames.jsonl` with one timing line per written frame,
//! - `<video>.meta.json` with the segment summary, written on close,
//! - one compact summary line appended to `segments_manifest.jsonl`.
//!
//! Frames are written at most once per `1 / record_fps`. A segment is rotated
//! once it has been open for the configured duration. The storage janitor runs
//! before every segment open.

pub mod encoder;
pub mod storage;
pub mod timing;

use chrono::{DateTime, Local};
use image::RgbImage;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub use encoder::{EncoderKind, SegmentEncoder};
pub use storage::{enforce_quota, scan, PruneReport};
pub use timing::{FrameTiming, SegmentMeta, SegmentTimeline};

use crate::error::CaptureError;
use crate::settings::Settings;
use crate::status::SegmentInfo;
use storage::{sidecar_path, FRAME_LOG_SUFFIX, META_SUFFIX, SEGMENT_PREFIX};

/// Manifest of closed segments, one JSON object per line.
pub const MANIFEST_FILE: &str = "segments_manifest.jsonl";
/// Sidecar lines are flushed every this many frames (and on close).
const FRAME_LOG_FLUSH_EVERY: u64 = 25;

/// What `record` did with a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    Disabled,
    Written,
    /// Inside the record-rate window.
    Skipped,
}

struct OpenSegment {
    encoder: Box<dyn SegmentEncoder>,
    video_path: PathBuf,
    frame_log_path: PathBuf,
    meta_path: PathBuf,
    frame_log: Option<BufWriter<File>>,
    timeline: SegmentTimeline,
    opened: Instant,
    last_write: Option<Instant>,
}

pub struct Recorder {
    settings: Settings,
    segment: Option<OpenSegment>,
    /// Set once the configured codec failed; later segments go straight to
    /// the fallback encoder.
    use_fallback: bool,
}

impl Recorder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            segment: None,
            use_fallback: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.segment.is_some()
    }

    pub fn active_segment(&self) -> Option<SegmentInfo> {
        self.segment.as_ref().map(|segment| SegmentInfo {
            video_path: segment.video_path.clone(),
            frame_log_path: segment.frame_log_path.clone(),
            written_frames: segment.timeline.written_frames(),
        })
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.settings.output_dir.join(MANIFEST_FILE)
    }

    /// Offer one normalized frame to the recorder.
    ///
    /// `captured_at` drives file names and sidecar timing; `now` drives the
    /// rate limit and rotation.
    pub fn record(
        &mut self,
        image: &RgbImage,
        captured_at: DateTime<Local>,
        now: Instant,
    ) -> Result<RecordOutcome, CaptureError> {
        if !self.settings.record_enabled {
            self.close(captured_at);
            return Ok(RecordOutcome::Disabled);
        }
        if self.segment.is_none() {
            self.open_segment(image.width(), image.height(), captured_at, now)?;
        }
        let Some(segment) = self.segment.as_mut() else {
            return Ok(RecordOutcome::Skipped);
        };

        let interval = self.settings.record_interval();
        let due = segment
            .last_write
            .map_or(true, |last| now.saturating_duration_since(last) >= interval);
        let mut outcome = RecordOutcome::Skipped;
        if due {
            if let Err(err) = segment.encoder.write(image) {
                let path = segment.video_path.display().to_string();
                if !EncoderKind::for_tag(segment.encoder.codec()).is_fallback() {
                    self.use_fallback = true;
                }
                self.close(captured_at);
                return Err(CaptureError::RecorderWrite {
                    path,
                    reason: format!("{:#}", err),
                });
            }
            let line = segment.timeline.push(captured_at);
            segment.write_timing(&line);
            segment.last_write = Some(now);
            outcome = RecordOutcome::Written;
        }

        if now.saturating_duration_since(segment.opened) >= self.settings.segment_duration {
            self.close(captured_at);
            self.open_segment(image.width(), image.height(), captured_at, now)?;
        }
        Ok(outcome)
    }

    /// Close the open segment, writing its summary. No-op when nothing is open.
    pub fn close(&mut self, closed_at: DateTime<Local>) -> Option<SegmentMeta> {
        let mut segment = self.segment.take()?;
        if let Err(err) = segment.encoder.finish() {
            log::warn!(
                "Recorder: finishing {} failed: {:#}",
                segment.video_path.display(),
                err
            );
        }
        if let Some(mut frame_log) = segment.frame_log.take() {
            if let Err(err) = frame_log.flush() {
                log::warn!(
                    "Recorder: flushing {} failed: {}",
                    segment.frame_log_path.display(),
                    err
                );
            }
        }

        let meta = segment.timeline.summarize(
            &segment.video_path,
            &segment.frame_log_path,
            segment.encoder.codec(),
            closed_at,
        );
        self.write_meta(&segment.meta_path, &meta);
        log::info!(
            "Recorder: closed segment {} frames={} drift_ms={} max_sync_error_ms={} matched={}",
            segment.video_path.display(),
            meta.written_frames,
            meta.timeline_drift_ms,
            meta.max_abs_sync_error_ms,
            meta.frame_time_matched
        );
        Some(meta)
    }

    fn open_segment(
        &mut self,
        width: u32,
        height: u32,
        opened_at: DateTime<Local>,
        now: Instant,
    ) -> Result<(), CaptureError> {
        let dir = self.settings.output_dir.clone();
        enforce_quota(&dir, self.settings.max_storage_bytes, None);
        self.try_open(&dir, width, height, opened_at, now)
            .map_err(|err| CaptureError::RecorderOpen {
                dir: dir.display().to_string(),
                reason: format!("{:#}", err),
            })
    }

    fn try_open(
        &mut self,
        dir: &Path,
        width: u32,
        height: u32,
        opened_at: DateTime<Local>,
        now: Instant,
    ) -> anyhow::Result<()> {
        use anyhow::Context;

        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let fps = self.settings.effective_record_fps();

        let mut kind = if self.use_fallback {
            EncoderKind::fallback()
        } else {
            EncoderKind::for_tag(&self.settings.codec)
        };
        let mut video_path = unique_segment_path(dir, opened_at, kind.extension());
        let encoder = match kind.open(&video_path, width, height, fps) {
            Ok(encoder) => encoder,
            Err(err) if !kind.is_fallback() => {
                log::warn!(
                    "Recorder: codec {} unavailable ({:#}); falling back to mjpg",
                    self.settings.codec,
                    err
                );
                let _ = fs::remove_file(&video_path);
                self.use_fallback = true;
                kind = EncoderKind::fallback();
                video_path = unique_segment_path(dir, opened_at, kind.extension());
                kind.open(&video_path, width, height, fps)?
            }
            Err(err) => return Err(err),
        };

        let frame_log_path = sidecar_path(&video_path, FRAME_LOG_SUFFIX);
        let frame_log = File::create(&frame_log_path)
            .with_context(|| format!("create {}", frame_log_path.display()))?;

        log::info!(
            "Recorder: opened segment {} codec={} {}x{} @ {} fps",
            video_path.display(),
            encoder.codec(),
            width,
            height,
            fps
        );
        self.segment = Some(OpenSegment {
            encoder,
            meta_path: sidecar_path(&video_path, META_SUFFIX),
            video_path,
            frame_log_path,
            frame_log: Some(BufWriter::new(frame_log)),
            timeline: SegmentTimeline::new(fps, opened_at),
            opened: now,
            last_write: None,
        });
        Ok(())
    }

    fn write_meta(&self, meta_path: &Path, meta: &SegmentMeta) {
        match serde_json::to_string_pretty(meta) {
            Ok(pretty) => {
                if let Err(err) = fs::write(meta_path, pretty) {
                    log::warn!("Recorder: writing {} failed: {}", meta_path.display(), err);
                }
            }
            Err(err) => log::warn!("Recorder: serializing segment meta failed: {}", err),
        }

        let manifest = self.manifest_path();
        let appended = serde_json::to_string(meta)
            .map_err(std::io::Error::from)
            .and_then(|line| {
                let mut file = OpenOptions::new().create(true).append(true).open(&manifest)?;
                writeln!(file, "{}", line)
            });
        if let Err(err) = appended {
            log::warn!("Recorder: appending to {} failed: {}", manifest.display(), err);
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.close(Local::now());
    }
}

impl OpenSegment {
    fn write_timing(&mut self, line: &FrameTiming) {
        let Some(frame_log) = self.frame_log.as_mut() else {
            return;
        };
        let written = serde_json::to_writer(&mut *frame_log, line)
            .map_err(std::io::Error::from)
            .and_then(|()| frame_log.write_all(b"\n"))
            .and_then(|()| {
                if line.frame_index % FRAME_LOG_FLUSH_EVERY == 0 {
                    frame_log.flush()
                } else {
                    Ok(())
                }
            });
        if let Err(err) = written {
            // Timing lines are best effort; the video keeps recording.
            log::warn!(
                "Recorder: frame log {} disabled: {}",
                self.frame_log_path.display(),
                err
            );
            self.frame_log = None;
        }
    }
}

/// `loop_YYYYmmdd_HHMMSS_mmm.<ext>`, with `_N` appended if that name is taken.
fn unique_segment_path(dir: &Path, opened_at: DateTime<Local>, extension: &str) -> PathBuf {
    let stem = format!("{}{}", SEGMENT_PREFIX, opened_at.format("%Y%m%d_%H%M%S_%3f"));
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            format!("{}.{}", stem, extension)
        } else {
            format!("{}_{}.{}", stem, attempt, extension)
        };
        let path = dir.join(name);
        if !path.exists() && !sidecar_path(&path, FRAME_LOG_SUFFIX).exists() {
            return path;
        }
        attempt += 1;
    }
}
