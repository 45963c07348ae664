//! Synthetic backend for `stub://` device identifiers.
//!
//! Produces a moving gradient at the configured geometry, paced to the capture
//! rate. Options are passed as query-like segments after the scheme:
//!
//! - `stub://pen`: always succeeds
//! - `stub://pen?fail-open`: `open` fails (exercises the retry path)
//! - `stub://pen?fail-read-after=N`: `read` fails after N frames
//! - `stub://pen?unpaced`: frames are returned as fast as they are requested

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};

use super::CameraBackend;
use crate::frame::Frame;
use crate::settings::Settings;

pub const STUB_SCHEME: &str = "stub://";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StubOptions {
    pub fail_open: bool,
    pub fail_read_after: Option<u64>,
    pub unpaced: bool,
}

impl StubOptions {
    /// Parse the options portion of a `stub://` identifier.
    pub fn parse(device: &str) -> Self {
        let mut options = Self::default();
        let Some((_, query)) = device.split_once('?') else {
            return options;
        };
        for part in query.split('&').map(str::trim) {
            match part.split_once('=') {
                Some(("fail-read-after", value)) => {
                    options.fail_read_after = value.parse().ok();
                }
                None if part == "fail-open" => options.fail_open = true,
                None if part == "unpaced" => options.unpaced = true,
                _ => log::warn!("StubBackend: ignoring unknown option '{}'", part),
            }
        }
        options
    }
}

pub struct StubBackend {
    name: String,
    width: u32,
    height: u32,
    frame_interval: Duration,
    options: StubOptions,
    opened: bool,
    frame_count: u64,
    next_frame_at: Option<Instant>,
}

impl StubBackend {
    pub fn new(settings: &Settings) -> Self {
        let label = settings
            .device
            .strip_prefix(STUB_SCHEME)
            .unwrap_or(&settings.device);
        let label = label.split('?').next().unwrap_or_default();
        Self {
            name: format!("stub:{}", label),
            width: settings.frame_width.max(1),
            height: settings.frame_height.max(1),
            frame_interval: Duration::from_secs_f64(1.0 / f64::from(settings.capture_fps.max(1))),
            options: StubOptions::parse(&settings.device),
            opened: false,
            frame_count: 0,
            next_frame_at: None,
        }
    }

    fn pace(&mut self) {
        if self.options.unpaced {
            return;
        }
        let now = Instant::now();
        if let Some(due) = self.next_frame_at {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        let base = self.next_frame_at.map_or(now, |due| due.max(now));
        self.next_frame_at = Some(base + self.frame_interval);
    }

    fn synthetic_image(&self) -> RgbImage {
        let shift = (self.frame_count % 256) as u32;
        RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift) % 256) as u8,
                ((x + y) % 256) as u8,
            ])
        })
    }
}

impl CameraBackend for StubBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.options.fail_open {
            return Err(anyhow!("synthetic open failure"));
        }
        self.opened = true;
        self.next_frame_at = None;
        log::info!(
            "StubBackend: opened {} ({}x{})",
            self.name,
            self.width,
            self.height
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        if !self.opened {
            return Err(anyhow!("stub backend not opened"));
        }
        if let Some(limit) = self.options.fail_read_after {
            if self.frame_count >= limit {
                return Err(anyhow!("synthetic read failure after {} frames", limit));
            }
        }
        self.pace();
        let image = self.synthetic_image();
        self.frame_count += 1;
        Ok(Frame::new(image))
    }

    fn close(&mut self) {
        self.opened = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_settings(device: &str) -> Settings {
        Settings {
            device: device.to_string(),
            frame_width: 32,
            frame_height: 24,
            capture_fps: 200,
            ..Settings::default()
        }
    }

    #[test]
    fn parses_options() {
        let options = StubOptions::parse("stub://pen?fail-open&fail-read-after=3&unpaced");
        assert!(options.fail_open);
        assert!(options.unpaced);
        assert_eq!(options.fail_read_after, Some(3));
        assert_eq!(StubOptions::parse("stub://pen"), StubOptions::default());
    }

    #[test]
    fn produces_frames_at_configured_geometry() -> Result<()> {
        let mut backend = StubBackend::new(&stub_settings("stub://pen"));
        assert_eq!(backend.name(), "stub:pen");
        backend.open()?;
        let frame = backend.read()?;
        assert_eq!((frame.width(), frame.height()), (32, 24));
        Ok(())
    }

    #[test]
    fn frame_timestamps_are_monotonic() -> Result<()> {
        let mut backend = StubBackend::new(&stub_settings("stub://pen"));
        backend.open()?;
        let first = backend.read()?;
        let second = backend.read()?;
        assert!(second.captured_instant > first.captured_instant);
        Ok(())
    }

    #[test]
    fn read_fails_after_limit() -> Result<()> {
        let mut backend = StubBackend::new(&stub_settings("stub://pen?fail-read-after=2&unpaced"));
        backend.open()?;
        backend.read()?;
        backend.read()?;
        assert!(backend.read().is_err());
        assert_eq!(backend.frame_count, 2);
        Ok(())
    }

    #[test]
    fn read_before_open_fails() {
        let mut backend = StubBackend::new(&stub_settings("stub://pen"));
        assert!(backend.read().is_err());
    }
}
