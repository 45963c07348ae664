//! Latest-frame publisher.
//!
//! The capture loop publishes each normalized frame; preview readers block in
//! `wait_next` until something newer than what they last saw exists. Readers
//! always get the newest frame, never a backlog.
//!
//! JPEG encoding is rate limited to the stream rate. Frames arriving faster only
//! refresh the capture time and geometry; the sequence number moves only when
//! new bytes are published.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::shared::Shared;

/// JPEG quality for live-preview frames.
pub const STREAM_JPEG_QUALITY: u8 = 82;

/// The single published record readers observe.
#[derive(Clone, Debug, Default)]
pub struct PublishedFrame {
    /// Strictly increasing; zero means nothing published yet.
    pub sequence: u64,
    pub jpeg: Option<Arc<[u8]>>,
    pub captured_at: Option<DateTime<Local>>,
    pub width: u32,
    pub height: u32,
}

/// Outcome of one `publish` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// New bytes were encoded under this sequence.
    Encoded(u64),
    /// Inside the rate-limit window; only metadata was refreshed.
    MetadataOnly,
}

/// Capture-thread side of the publisher: owns the encode rate limiter.
#[derive(Debug, Default)]
pub(crate) struct StreamPublisher {
    next_encode_at: Option<Instant>,
}

impl StreamPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the rate-limit window (after a camera reopen).
    pub fn reset(&mut self) {
        self.next_encode_at = None;
    }

    pub fn publish(
        &mut self,
        shared: &Shared,
        image: &RgbImage,
        captured_at: DateTime<Local>,
        now: Instant,
        interval: Duration,
    ) -> Result<PublishOutcome> {
        let (width, height) = image.dimensions();
        let throttled = self.next_encode_at.is_some_and(|due| now < due);
        if throttled {
            let mut state = shared.lock();
            if state.published.jpeg.is_some() {
                state.published.captured_at = Some(captured_at);
                state.published.width = width;
                state.published.height = height;
                return Ok(PublishOutcome::MetadataOnly);
            }
        }

        // Encode outside the lock; readers never wait on compression.
        let jpeg = encode_jpeg(image, STREAM_JPEG_QUALITY)?;
        let sequence = {
            let mut state = shared.lock();
            let published = &mut state.published;
            published.sequence += 1;
            published.jpeg = Some(Arc::from(jpeg));
            published.captured_at = Some(captured_at);
            published.width = width;
            published.height = height;
            published.sequence
        };
        shared.notify_frame();
        self.next_encode_at = Some(now + interval);
        Ok(PublishOutcome::Encoded(sequence))
    }
}

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode_image(image)
        .context("encode jpeg")?;
    Ok(bytes)
}

impl Shared {
    /// Current JPEG if one exists; otherwise wait (once) up to `timeout`.
    pub fn wait_latest(&self, timeout: Duration) -> Option<Arc<[u8]>> {
        let guard = self.lock();
        if let Some(jpeg) = &guard.published.jpeg {
            return Some(Arc::clone(jpeg));
        }
        let guard = self.wait_until(guard, timeout, |state| state.published.jpeg.is_some());
        guard.published.jpeg.clone()
    }

    /// Block until a frame newer than `last_seen` exists or `timeout` elapses.
    ///
    /// Returns the latest sequence and bytes at wake-up. When nothing newer
    /// arrived the returned sequence is `<= last_seen`.
    pub fn wait_next(&self, last_seen: u64, timeout: Duration) -> (u64, Option<Arc<[u8]>>) {
        let guard = self.lock();
        let guard = self.wait_until(guard, timeout, |state| state.published.sequence > last_seen);
        (guard.published.sequence, guard.published.jpeg.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use image::Rgb;

    fn image() -> RgbImage {
        RgbImage::from_pixel(16, 12, Rgb([90, 60, 30]))
    }

    #[test]
    fn sequence_strictly_increases_across_encodes() -> Result<()> {
        let shared = Shared::new(Settings::default());
        let mut publisher = StreamPublisher::new();
        let start = Instant::now();
        let mut last = 0;
        for i in 0..5u64 {
            let now = start + Duration::from_millis(200 * i);
            let outcome =
                publisher.publish(&shared, &image(), Local::now(), now, Duration::from_millis(100))?;
            let PublishOutcome::Encoded(sequence) = outcome else {
                panic!("expected encode at step {}", i);
            };
            assert!(sequence > last);
            last = sequence;
        }
        assert_eq!(last, 5);
        Ok(())
    }

    #[test]
    fn throttled_publish_refreshes_metadata_only() -> Result<()> {
        let shared = Shared::new(Settings::default());
        let mut publisher = StreamPublisher::new();
        let start = Instant::now();
        let interval = Duration::from_millis(100);
        publisher.publish(&shared, &image(), Local::now(), start, interval)?;

        let later = Local::now() + chrono::Duration::seconds(5);
        let small = RgbImage::new(8, 6);
        let outcome =
            publisher.publish(&shared, &small, later, start + Duration::from_millis(10), interval)?;
        assert_eq!(outcome, PublishOutcome::MetadataOnly);

        let state = shared.lock();
        assert_eq!(state.published.sequence, 1);
        assert_eq!(state.published.captured_at, Some(later));
        assert_eq!((state.published.width, state.published.height), (8, 6));
        Ok(())
    }

    #[test]
    fn reset_allows_immediate_encode() -> Result<()> {
        let shared = Shared::new(Settings::default());
        let mut publisher = StreamPublisher::new();
        let start = Instant::now();
        let interval = Duration::from_secs(10);
        publisher.publish(&shared, &image(), Local::now(), start, interval)?;
        publisher.reset();
        let outcome = publisher.publish(&shared, &image(), Local::now(), start, interval)?;
        assert_eq!(outcome, PublishOutcome::Encoded(2));
        Ok(())
    }

    #[test]
    fn wait_next_times_out_without_new_frame() {
        let shared = Shared::new(Settings::default());
        let started = Instant::now();
        let (sequence, jpeg) = shared.wait_next(0, Duration::from_millis(50));
        assert_eq!(sequence, 0);
        assert!(jpeg.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn concurrent_publish_wakes_waiter() -> Result<()> {
        let shared = Arc::new(Shared::new(Settings::default()));
        let waiter = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let started = Instant::now();
                let result = shared.wait_next(0, Duration::from_secs(5));
                (result, started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        let mut publisher = StreamPublisher::new();
        publisher.publish(&shared, &image(), Local::now(), Instant::now(), Duration::ZERO)?;

        let ((sequence, jpeg), waited) = waiter.join().expect("waiter thread");
        assert_eq!(sequence, 1);
        assert!(jpeg.is_some_and(|bytes| bytes.starts_with(&[0xFF, 0xD8])));
        assert!(waited < Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn waiter_gets_only_the_newest_frame() -> Result<()> {
        let shared = Shared::new(Settings::default());
        let mut publisher = StreamPublisher::new();
        let start = Instant::now();
        for i in 0..3u64 {
            publisher.publish(
                &shared,
                &image(),
                Local::now(),
                start + Duration::from_secs(i),
                Duration::ZERO,
            )?;
        }
        let (sequence, _) = shared.wait_next(1, Duration::from_millis(10));
        assert_eq!(sequence, 3);
        Ok(())
    }

    #[test]
    fn released_waiters_return_before_timeout() {
        let shared = Arc::new(Shared::new(Settings::default()));
        let waiter = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let started = Instant::now();
                let _ = shared.wait_next(0, Duration::from_secs(10));
                started.elapsed()
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        shared.release_waiters();
        let waited = waiter.join().expect("waiter thread");
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn unbounded_timeouts_block_until_woken() -> Result<()> {
        let shared = Arc::new(Shared::new(Settings::default()));
        let next = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || shared.wait_next(0, Duration::MAX))
        };
        let latest = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || shared.wait_latest(Duration::MAX))
        };
        std::thread::sleep(Duration::from_millis(50));
        let mut publisher = StreamPublisher::new();
        publisher.publish(&shared, &image(), Local::now(), Instant::now(), Duration::ZERO)?;

        let (sequence, jpeg) = next.join().expect("wait_next thread");
        assert_eq!(sequence, 1);
        assert!(jpeg.is_some());
        assert!(latest.join().expect("wait_latest thread").is_some());

        let released = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || shared.wait_next(1, Duration::MAX))
        };
        // Keep releasing until the waiter has entered and left the wait.
        while !released.is_finished() {
            shared.release_waiters();
            std::thread::sleep(Duration::from_millis(20));
        }
        let (sequence, _) = released.join().expect("released thread");
        assert_eq!(sequence, 1);
        Ok(())
    }

    #[test]
    fn wait_latest_returns_existing_frame_immediately() -> Result<()> {
        let shared = Shared::new(Settings::default());
        assert!(shared.wait_latest(Duration::from_millis(10)).is_none());
        let mut publisher = StreamPublisher::new();
        publisher.publish(&shared, &image(), Local::now(), Instant::now(), Duration::ZERO)?;
        let started = Instant::now();
        assert!(shared.wait_latest(Duration::from_secs(5)).is_some());
        assert!(started.elapsed() < Duration::from_secs(1));
        Ok(())
    }
}
