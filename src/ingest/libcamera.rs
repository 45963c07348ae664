//! Vendor camera-stack backend (libcamera).
//!
//! CSI sensors on Raspberry Pi boards (`csi`, `ov5647`, ...) are driven by
//! libcamera. This backend reaches it through GStreamer's `libcamerasrc`:
//!
//! `libcamerasrc ! video/x-raw,width=W,height=H,framerate=F/1 ! videoconvert !
//!  video/x-raw,format=RGB ! appsink`
//!
//! Built only with the `backend-libcamera` feature; without it `open` fails with
//! a "not compiled in" reason so the selector can move on.

#[cfg(feature = "backend-libcamera")]
use anyhow::Context;
#[cfg(feature = "backend-libcamera")]
use gstreamer::prelude::*;
use anyhow::Result;
#[cfg(feature = "backend-libcamera")]
use std::time::Duration;

use super::CameraBackend;
use crate::frame::Frame;
use crate::settings::Settings;

pub struct LibcameraBackend {
    width: u32,
    height: u32,
    fps: u32,
    #[cfg(feature = "backend-libcamera")]
    pipeline: Option<GstreamerPipeline>,
}

impl LibcameraBackend {
    pub fn new(settings: &Settings) -> Self {
        Self {
            width: settings.frame_width.max(1),
            height: settings.frame_height.max(1),
            fps: settings.capture_fps.max(1),
            #[cfg(feature = "backend-libcamera")]
            pipeline: None,
        }
    }

    /// GStreamer launch line for the configured geometry.
    pub fn pipeline_description(&self) -> String {
        format!(
            "libcamerasrc ! video/x-raw,width={},height={},framerate={}/1 ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=appsink sync=false max-buffers=1 drop=true",
            self.width, self.height, self.fps
        )
    }
}

#[cfg(not(feature = "backend-libcamera"))]
impl CameraBackend for LibcameraBackend {
    fn name(&self) -> &str {
        "libcamera"
    }

    fn open(&mut self) -> Result<()> {
        anyhow::bail!(
            "libcamera support not compiled in (enable the backend-libcamera feature); pipeline would be: {}",
            self.pipeline_description()
        )
    }

    fn read(&mut self) -> Result<Frame> {
        anyhow::bail!("libcamera backend not opened")
    }

    fn close(&mut self) {}
}

// ----------------------------------------------------------------------------
// GStreamer pipeline
// ----------------------------------------------------------------------------

#[cfg(feature = "backend-libcamera")]
struct GstreamerPipeline {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
}

#[cfg(feature = "backend-libcamera")]
impl LibcameraBackend {
    /// Four frame periods, kept between 0.5 s and 2 s so a stalled pull never
    /// outlasts a stop.
    fn frame_timeout(&self) -> Duration {
        let base_ms = (1000 / self.fps.max(1)).saturating_mul(4);
        Duration::from_millis(u64::from(base_ms.clamp(500, 2000)))
    }

    fn build_pipeline(&self) -> Result<GstreamerPipeline> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline = gstreamer::parse::launch(&self.pipeline_description())
            .context("build libcamera pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("libcamera pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(GstreamerPipeline { pipeline, appsink })
    }
}

#[cfg(feature = "backend-libcamera")]
impl GstreamerPipeline {
    /// Surface a pending error or EOS from the pipeline bus.
    fn poll_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    anyhow::bail!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    );
                }
                MessageView::Eos(..) => anyhow::bail!("libcamera pipeline reached EOS"),
                _ => {}
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("LibcameraBackend: failed to stop pipeline: {}", err);
        }
    }
}

#[cfg(feature = "backend-libcamera")]
impl Drop for LibcameraBackend {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "backend-libcamera")]
impl CameraBackend for LibcameraBackend {
    fn name(&self) -> &str {
        "libcamera"
    }

    fn open(&mut self) -> Result<()> {
        self.close();
        let pipeline = self.build_pipeline()?;
        if let Err(err) = pipeline.pipeline.set_state(gstreamer::State::Playing) {
            pipeline.shutdown();
            return Err(anyhow::Error::new(err).context("set libcamera pipeline to Playing"));
        }
        self.pipeline = Some(pipeline);
        log::info!(
            "LibcameraBackend: opened ({}x{} @ {} fps)",
            self.width,
            self.height,
            self.fps
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        let timeout = self.frame_timeout();
        let pipeline = self
            .pipeline
            .as_ref()
            .context("libcamera backend not opened")?;
        pipeline.poll_bus()?;

        let clock_timeout = gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let sample = pipeline
            .appsink
            .try_pull_sample(clock_timeout)
            .ok_or_else(|| anyhow::anyhow!("libcamera stream stalled"))?;
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Frame::from_rgb(pixels, width, height)
            .ok_or_else(|| anyhow::anyhow!("libcamera sample size mismatch"))
    }

    fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown();
            log::info!("LibcameraBackend: closed");
        }
    }
}

#[cfg(feature = "backend-libcamera")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("libcamera sample missing buffer")?;
    let caps = sample.caps().context("libcamera sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .context("parse libcamera caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map libcamera buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data.get(..len).context("libcamera buffer shorter than frame")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("libcamera buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
