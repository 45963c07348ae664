//! Generic frame-grabber backend on a V4L2 device node.
//!
//! Requests RGB24 at the configured geometry; drivers that refuse fall back to
//! whatever format they report, which is then converted (NV12) or decoded (MJPG).
//! Built only with the `backend-v4l2` feature; without it `open` fails with a
//! "not compiled in" reason so the selector can move on.

use anyhow::Result;
#[cfg(feature = "backend-v4l2")]
use anyhow::{anyhow, Context};
#[cfg(feature = "backend-v4l2")]
use ouroboros::self_referencing;

use super::CameraBackend;
use crate::frame::Frame;
use crate::settings::Settings;

/// Device nodes tried when the identifier does not name one.
pub const DEFAULT_DEVICES: [&str; 3] = ["0", "/dev/video0", "/dev/video1"];

/// Longest wait for one dequeued buffer before `read` reports a stall.
#[cfg(feature = "backend-v4l2")]
const DEQUEUE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Map a device identifier onto a device node path (`2` → `/dev/video2`).
pub fn device_path(device: &str) -> String {
    if !device.is_empty() && device.chars().all(|c| c.is_ascii_digit()) {
        format!("/dev/video{}", device)
    } else {
        device.to_string()
    }
}

pub struct V4l2Backend {
    name: String,
    path: String,
    width: u32,
    height: u32,
    fps: u32,
    #[cfg(feature = "backend-v4l2")]
    state: Option<V4l2State>,
    #[cfg(feature = "backend-v4l2")]
    active: ActiveFormat,
}

#[cfg(feature = "backend-v4l2")]
#[derive(Clone, Copy, Debug)]
struct ActiveFormat {
    width: u32,
    height: u32,
    kind: PixelKind,
}

#[cfg(feature = "backend-v4l2")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PixelKind {
    Rgb24,
    Nv12,
    Mjpeg,
}

#[cfg(feature = "backend-v4l2")]
#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Backend {
    pub fn new(device: &str, settings: &Settings) -> Self {
        Self {
            name: format!("v4l2:{}", device),
            path: device_path(device),
            width: settings.frame_width.max(1),
            height: settings.frame_height.max(1),
            fps: settings.capture_fps.max(1),
            #[cfg(feature = "backend-v4l2")]
            state: None,
            #[cfg(feature = "backend-v4l2")]
            active: ActiveFormat {
                width: settings.frame_width.max(1),
                height: settings.frame_height.max(1),
                kind: PixelKind::Rgb24,
            },
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(feature = "backend-v4l2")]
impl CameraBackend for V4l2Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.close();
        let mut device = v4l::Device::with_path(&self.path)
            .with_context(|| format!("open v4l2 device {}", self.path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.width;
        format.height = self.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Backend: failed to set format on {}: {}", self.path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        let params = v4l::video::capture::Parameters::with_fps(self.fps);
        if let Err(err) = device.set_params(&params) {
            log::warn!("V4l2Backend: failed to set fps on {}: {}", self.path, err);
        }

        let kind = match &format.fourcc.repr {
            b"RGB3" => PixelKind::Rgb24,
            b"NV12" => PixelKind::Nv12,
            b"MJPG" => PixelKind::Mjpeg,
            other => {
                return Err(anyhow!(
                    "unsupported v4l2 pixel format {}",
                    String::from_utf8_lossy(other)
                ))
            }
        };
        self.active = ActiveFormat {
            width: format.width,
            height: format.height,
            kind,
        };

        let state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                let mut stream =
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))?;
                stream.set_timeout(DEQUEUE_TIMEOUT);
                Ok(stream)
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Backend: opened {} ({}x{} {:?})",
            self.path,
            self.active.width,
            self.active.height,
            self.active.kind
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not opened")?;
        let buf = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .context("capture v4l2 frame")?;
        if buf.is_empty() {
            return Err(anyhow!("v4l2 returned an empty buffer"));
        }

        let ActiveFormat {
            width,
            height,
            kind,
        } = self.active;
        let image = match kind {
            PixelKind::Rgb24 => {
                let expected = (width as usize) * (height as usize) * 3;
                let mut pixels = buf;
                pixels.truncate(expected);
                image::RgbImage::from_raw(width, height, pixels)
                    .ok_or_else(|| anyhow!("v4l2 RGB buffer shorter than {}x{}", width, height))?
            }
            PixelKind::Nv12 => {
                let expected = (width as usize) * (height as usize) * 3 / 2;
                let pixels = buf.get(..expected).context("v4l2 NV12 buffer truncated")?;
                let rgb = super::normalize::nv12_to_rgb(pixels, width, height)
                    .context("convert v4l2 NV12 frame")?;
                image::RgbImage::from_raw(width, height, rgb)
                    .context("v4l2 NV12 conversion size mismatch")?
            }
            PixelKind::Mjpeg => super::mjpeg::decode_jpeg(&buf)?,
        };
        Ok(Frame::new(image))
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Backend: closed {}", self.path);
        }
    }
}

#[cfg(not(feature = "backend-v4l2"))]
impl CameraBackend for V4l2Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        anyhow::bail!(
            "v4l2 support not compiled in (enable the backend-v4l2 feature) for {} ({}x{} @ {} fps)",
            self.path,
            self.width,
            self.height,
            self.fps
        )
    }

    fn read(&mut self) -> Result<Frame> {
        anyhow::bail!("v4l2 backend not opened")
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_identifiers_map_to_device_nodes() {
        assert_eq!(device_path("0"), "/dev/video0");
        assert_eq!(device_path("12"), "/dev/video12");
        assert_eq!(device_path("/dev/video3"), "/dev/video3");
        assert_eq!(device_path("usbcam"), "usbcam");
    }

    #[test]
    fn missing_device_fails_to_open() {
        let mut backend = V4l2Backend::new("/dev/video-does-not-exist", &Settings::default());
        assert_eq!(backend.name(), "v4l2:/dev/video-does-not-exist");
        assert_eq!(backend.path(), "/dev/video-does-not-exist");
        assert!(backend.open().is_err());
        assert!(backend.read().is_err());
        backend.close();
    }
}
