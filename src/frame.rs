//! Raw frame container.
//!
//! A `Frame` is owned by the capture loop for exactly one iteration. It is never
//! shared across threads by reference; readers only ever see the JPEG bytes the
//! publisher derives from it.

use chrono::{DateTime, Local};
use image::RgbImage;
use std::time::Instant;

/// One captured RGB frame plus its capture times.
#[derive(Debug)]
pub struct Frame {
    /// 3-channel pixel buffer.
    pub image: RgbImage,

    /// Wall-clock capture time (written to sidecar logs and metadata).
    pub captured_at: DateTime<Local>,

    /// Monotonic capture instant (drives rate limiting and rotation).
    pub captured_instant: Instant,
}

impl Frame {
    /// Wrap a freshly captured image, stamping it with the current time.
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Local::now(),
            captured_instant: Instant::now(),
        }
    }

    /// Build a frame from raw RGB24 bytes.
    ///
    /// Returns `None` when the buffer length does not match `width * height * 3`.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Option<Self> {
        RgbImage::from_raw(width, height, pixels).map(Self::new)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// A frame with no pixels is treated as a failed read.
    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_rejects_length_mismatch() {
        assert!(Frame::from_rgb(vec![0u8; 10], 2, 2).is_none());
        let frame = Frame::from_rgb(vec![0u8; 12], 2, 2).expect("valid frame");
        assert_eq!((frame.width(), frame.height()), (2, 2));
        assert!(!frame.is_empty());
    }

    #[test]
    fn zero_sized_frame_is_empty() {
        let frame = Frame::new(RgbImage::new(0, 0));
        assert!(frame.is_empty());
    }
}
