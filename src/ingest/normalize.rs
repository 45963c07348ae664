use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::settings::Rotation;

/// Resize to the configured geometry, then rotate by a right angle.
///
/// Frames that already match the target size skip the resampling pass.
pub fn normalize_frame(image: RgbImage, width: u32, height: u32, rotation: Rotation) -> RgbImage {
    let resized = resize_to(image, width, height);
    rotate(resized, rotation)
}

fn resize_to(image: RgbImage, width: u32, height: u32) -> RgbImage {
    let width = width.max(1);
    let height = height.max(1);
    if image.width() == width && image.height() == height {
        return image;
    }
    imageops::resize(&image, width, height, FilterType::Triangle)
}

fn rotate(image: RgbImage, rotation: Rotation) -> RgbImage {
    match rotation {
        Rotation::None => image,
        Rotation::Clockwise90 => imageops::rotate90(&image),
        Rotation::Half => imageops::rotate180(&image),
        Rotation::Clockwise270 => imageops::rotate270(&image),
    }
}

/// Convert packed NV12 (Y plane + interleaved UV) into RGB24.
#[cfg_attr(not(feature = "backend-v4l2"), allow(dead_code))]
pub(crate) fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w.checked_mul(h)?;
    let expected = y_plane.checked_add(y_plane / 2)?;
    if pixels.len() != expected {
        return None;
    }

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let r = y + 1.402_f32 * v;
            let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
            let b = y + 1.772_f32 * u;

            let offset = (j * w + i) * 3;
            rgb[offset] = clamp_to_u8(r);
            rgb[offset + 1] = clamp_to_u8(g);
            rgb[offset + 2] = clamp_to_u8(b);
        }
    }
    Some(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
