//! Segment video encoders.
//!
//! - `mjpg` is written in-process as a Motion-JPEG elementary stream
//!   (`.mjpeg`, concatenated JPEG images). It is always available.
//! - `mp4v`, `xvid` and `divx` (MPEG-4 Part 2) and `avc1`, `h264` and `x264`
//!   (H.264) go through a GStreamer pipeline into an `.mp4` container:
//!
//!   `appsrc ! videoconvert ! <encoder> ! mp4mux ! filesink`
//!
//!   Built only with the `encoder-gstreamer` feature; without it, or when the
//!   encoder plugin is missing, `open` fails and the recorder falls back to `mjpg`.
//! - Any other tag fails to open.

use anyhow::{anyhow, bail, Context, Result};
#[cfg(feature = "encoder-gstreamer")]
use gstreamer::prelude::*;
use image::RgbImage;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
#[cfg(feature = "encoder-gstreamer")]
use std::time::Duration;

use crate::publish::encode_jpeg;
use crate::settings::FALLBACK_CODEC;

/// JPEG quality for recorded Motion-JPEG segments.
pub const RECORD_JPEG_QUALITY: u8 = 90;
#[cfg(feature = "encoder-gstreamer")]
const EOS_TIMEOUT: Duration = Duration::from_secs(5);

pub trait SegmentEncoder: Send {
    /// Codec tag actually in use.
    fn codec(&self) -> &str;
    fn write(&mut self, image: &RgbImage) -> Result<()>;
    /// Flush and finalize the container. Safe to call more than once.
    fn finish(&mut self) -> Result<()>;
}

/// How a codec tag is turned into a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncoderKind {
    Mjpeg,
    /// GStreamer encoder element feeding `mp4mux`.
    Gstreamer { tag: String, element: &'static str },
    Unsupported(String),
}

impl EncoderKind {
    pub fn for_tag(tag: &str) -> Self {
        let lowered = tag.to_lowercase();
        match lowered.as_str() {
            "mjpg" => Self::Mjpeg,
            "avc1" | "h264" | "x264" => Self::Gstreamer {
                tag: lowered,
                element: "x264enc",
            },
            "mp4v" | "xvid" | "divx" => Self::Gstreamer {
                tag: lowered,
                element: "avenc_mpeg4",
            },
            _ => Self::Unsupported(lowered),
        }
    }

    pub fn fallback() -> Self {
        Self::for_tag(FALLBACK_CODEC)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mjpeg => "mjpeg",
            Self::Gstreamer { .. } | Self::Unsupported(_) => "mp4",
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Mjpeg)
    }

    pub fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn SegmentEncoder>> {
        match self {
            Self::Mjpeg => Ok(Box::new(MjpegSegmentWriter::create(path)?)),
            Self::Gstreamer { tag, element } => open_gstreamer(path, tag, element, width, height, fps),
            Self::Unsupported(tag) => bail!("no encoder for codec tag {:?}", tag),
        }
    }
}

// ---- Motion-JPEG

pub struct MjpegSegmentWriter {
    out: Option<BufWriter<File>>,
    path: PathBuf,
}

impl MjpegSegmentWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        Ok(Self {
            out: Some(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }
}

impl SegmentEncoder for MjpegSegmentWriter {
    fn codec(&self) -> &str {
        FALLBACK_CODEC
    }

    fn write(&mut self, image: &RgbImage) -> Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| anyhow!("mjpeg writer for {} already finished", self.path.display()))?;
        let jpeg = encode_jpeg(image, RECORD_JPEG_QUALITY)?;
        out.write_all(&jpeg)
            .with_context(|| format!("write {}", self.path.display()))
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        out.flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        out.get_ref().sync_data().ok();
        Ok(())
    }
}

impl Drop for MjpegSegmentWriter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

// ---- GStreamer mp4

#[cfg(not(feature = "encoder-gstreamer"))]
fn open_gstreamer(
    _path: &Path,
    tag: &str,
    element: &str,
    _width: u32,
    _height: u32,
    _fps: u32,
) -> Result<Box<dyn SegmentEncoder>> {
    bail!(
        "{} encoding not compiled in (enable the encoder-gstreamer feature for {})",
        tag,
        element
    )
}

#[cfg(feature = "encoder-gstreamer")]
fn open_gstreamer(
    path: &Path,
    tag: &str,
    element: &str,
    width: u32,
    height: u32,
    fps: u32,
) -> Result<Box<dyn SegmentEncoder>> {
    Ok(Box::new(GstreamerSegmentWriter::create(
        path, tag, element, width, height, fps,
    )?))
}

#[cfg(feature = "encoder-gstreamer")]
pub struct GstreamerSegmentWriter {
    pipeline: Option<gstreamer::Pipeline>,
    appsrc: gstreamer_app::AppSrc,
    info: gstreamer_video::VideoInfo,
    tag: String,
    path: PathBuf,
    frame_duration: gstreamer::ClockTime,
    frames: u64,
}

#[cfg(feature = "encoder-gstreamer")]
impl GstreamerSegmentWriter {
    pub fn create(
        path: &Path,
        tag: &str,
        element: &str,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        let fps = fps.max(1);
        let fps_num = i32::try_from(fps).context("record fps out of range")?;
        let info = gstreamer_video::VideoInfo::builder(gstreamer_video::VideoFormat::Rgb, width, height)
            .fps(gstreamer::Fraction::new(fps_num, 1))
            .build()
            .context("describe raw segment frames")?;
        let caps = info.to_caps().context("raw segment caps")?;

        let appsrc = gstreamer_app::AppSrc::builder()
            .name("src")
            .caps(&caps)
            .format(gstreamer::Format::Time)
            .build();
        let make = |factory: &str| {
            gstreamer::ElementFactory::make(factory)
                .build()
                .with_context(|| format!("create gstreamer element {}", factory))
        };
        let convert = make("videoconvert")?;
        let encoder = make(element)?;
        let muxer = make("mp4mux")?;
        let filesink = gstreamer::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .property("async", false)
            .build()
            .context("create gstreamer element filesink")?;

        let pipeline = gstreamer::Pipeline::new();
        let elements = [appsrc.upcast_ref(), &convert, &encoder, &muxer, &filesink];
        pipeline
            .add_many(elements)
            .context("assemble segment pipeline")?;
        gstreamer::Element::link_many(elements).context("link segment pipeline")?;

        if let Err(err) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(anyhow::Error::new(err).context("set segment pipeline to Playing"));
        }
        let writer = Self {
            pipeline: Some(pipeline),
            appsrc,
            info,
            tag: tag.to_string(),
            path: path.to_path_buf(),
            frame_duration: gstreamer::ClockTime::from_nseconds(1_000_000_000 / u64::from(fps)),
            frames: 0,
        };
        writer.poll_bus()?;
        log::debug!(
            "GstreamerSegmentWriter: encoding {} ({}) {}x{} @ {} fps -> {}",
            tag,
            element,
            width,
            height,
            fps,
            path.display()
        );
        Ok(writer)
    }

    /// Surface a pending pipeline error without waiting.
    fn poll_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.as_ref().and_then(|pipeline| pipeline.bus()) else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            if let gstreamer::MessageView::Error(err) = message.view() {
                bail!("segment pipeline error: {}", err.error());
            }
        }
        Ok(())
    }

    /// Copy tightly packed RGB rows into the stride GStreamer expects.
    fn frame_buffer(&self, image: &RgbImage) -> Result<gstreamer::Buffer> {
        let row_bytes = image.width() as usize * 3;
        let stride = usize::try_from(self.info.stride()[0]).context("negative frame stride")?;
        let mut bytes = vec![0u8; self.info.size()];
        for (row, src) in image.as_raw().chunks_exact(row_bytes).enumerate() {
            let start = row * stride;
            bytes
                .get_mut(start..start + row_bytes)
                .context("frame row outside buffer")?
                .copy_from_slice(src);
        }

        let mut buffer = gstreamer::Buffer::from_mut_slice(bytes);
        let meta = buffer
            .get_mut()
            .ok_or_else(|| anyhow!("new frame buffer is shared"))?;
        meta.set_pts(self.frame_duration * self.frames);
        meta.set_duration(self.frame_duration);
        Ok(buffer)
    }
}

#[cfg(feature = "encoder-gstreamer")]
impl SegmentEncoder for GstreamerSegmentWriter {
    fn codec(&self) -> &str {
        &self.tag
    }

    fn write(&mut self, image: &RgbImage) -> Result<()> {
        if self.pipeline.is_none() {
            bail!("segment writer for {} already finished", self.path.display());
        }
        if image.dimensions() != (self.info.width(), self.info.height()) {
            bail!(
                "frame is {}x{}, segment expects {}x{}",
                image.width(),
                image.height(),
                self.info.width(),
                self.info.height()
            );
        }
        self.poll_bus()?;
        let buffer = self.frame_buffer(image)?;
        self.appsrc
            .push_buffer(buffer)
            .map_err(|flow| anyhow!("push frame to segment pipeline: {:?}", flow))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        // EOS makes mp4mux write the moov atom.
        let mut outcome = self
            .appsrc
            .end_of_stream()
            .map(|_| ())
            .map_err(|flow| anyhow!("end segment stream: {:?}", flow));
        if outcome.is_ok() {
            if let Some(bus) = pipeline.bus() {
                let timeout = gstreamer::ClockTime::from_mseconds(EOS_TIMEOUT.as_millis() as u64);
                outcome = Err(anyhow!("segment pipeline did not drain within {:?}", EOS_TIMEOUT));
                for message in bus.iter_timed(timeout) {
                    match message.view() {
                        gstreamer::MessageView::Eos(..) => {
                            outcome = Ok(());
                            break;
                        }
                        gstreamer::MessageView::Error(err) => {
                            outcome = Err(anyhow!("segment pipeline error: {}", err.error()));
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
        if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerSegmentWriter: failed to stop pipeline: {}", err);
        }
        outcome.with_context(|| format!("finalize {}", self.path.display()))
    }
}

#[cfg(feature = "encoder-gstreamer")]
impl Drop for GstreamerSegmentWriter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
