//! Motion-JPEG byte-stream framing.
//!
//! Camera utilities that write MJPEG to a pipe give no framing guarantees: one
//! read may hold half a frame, several frames, or leading garbage. `MjpegFramer`
//! accumulates chunks and cuts complete JPEG images out of the stream by their
//! start-of-image (FF D8) and end-of-image (FF D9) markers.

use anyhow::{Context, Result};
use image::RgbImage;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Buffer size above which a frame with no end marker is considered runaway.
pub const MAX_PENDING_BYTES: usize = 6 * 1024 * 1024;
/// Tail kept when a runaway buffer is trimmed.
pub const TRIM_KEEP_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct MjpegFramer {
    buffer: Vec<u8>,
}

impl MjpegFramer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256 * 1024),
        }
    }

    /// Append a chunk read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes currently held waiting for a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Cut the next complete JPEG out of the buffer, if one is present.
    ///
    /// Leading bytes before the first SOI are dropped. With no SOI at all only the
    /// last two bytes are kept (they may hold half a marker). An SOI with no EOI
    /// past `MAX_PENDING_BYTES` is trimmed to its last `TRIM_KEEP_BYTES`.
    pub fn next_jpeg(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }

        let Some(start) = find_marker(&self.buffer, SOI, 0) else {
            if self.buffer.len() > 2 {
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
            return None;
        };
        if start > 0 {
            self.buffer.drain(..start);
        }

        let Some(end) = find_marker(&self.buffer, EOI, 2) else {
            if self.buffer.len() > MAX_PENDING_BYTES {
                let drain_len = self.buffer.len() - TRIM_KEEP_BYTES;
                self.buffer.drain(..drain_len);
            }
            return None;
        };

        let frame_end = end + 2;
        let jpeg: Vec<u8> = self.buffer.drain(..frame_end).collect();
        Some(jpeg)
    }
}

fn find_marker(buffer: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if buffer.len() < from + 2 {
        return None;
    }
    buffer[from..]
        .windows(2)
        .position(|pair| pair == marker)
        .map(|pos| pos + from)
}

/// Decode a JPEG into an RGB image.
pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg")?;
    Ok(image.into_rgb8())
}
