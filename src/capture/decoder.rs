//! Raw device buffers to packed RGB24.

use image::{ImageFormat, RgbImage};

use super::frame::PixelFormat;
use super::CaptureError;

pub fn decode_frame(
    data: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<RgbImage, CaptureError> {
    match format {
        PixelFormat::Mjpeg => {
            let decoded = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
                .map_err(|e| CaptureError::Decode(e.to_string()))?;
            Ok(decoded.to_rgb8())
        }
        PixelFormat::Rgb24 => {
            let expected = packed_len(width, height, 3);
            let pixels = data
                .get(..expected)
                .ok_or(CaptureError::InvalidFrame {
                    expected,
                    actual: data.len(),
                })?
                .to_vec();
            RgbImage::from_raw(width, height, pixels).ok_or(CaptureError::InvalidFrame {
                expected,
                actual: data.len(),
            })
        }
        PixelFormat::Bgr24 => {
            let mut image = decode_frame(data, width, height, PixelFormat::Rgb24)?;
            for px in image.pixels_mut() {
                px.0.swap(0, 2);
            }
            Ok(image)
        }
        PixelFormat::Yuyv => yuyv_to_rgb(data, width, height),
    }
}

fn packed_len(width: u32, height: u32, bpp: usize) -> usize {
    width as usize * height as usize * bpp
}

/// YUYV 4:2:2: every 4 bytes `[Y0 U Y1 V]` carry two pixels sharing chroma.
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage, CaptureError> {
    let expected = packed_len(width, height, 2);
    if data.len() < expected || width % 2 != 0 {
        return Err(CaptureError::InvalidFrame {
            expected,
            actual: data.len(),
        });
    }

    let mut rgb = Vec::with_capacity(packed_len(width, height, 3));
    for chunk in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb).ok_or(CaptureError::InvalidFrame {
        expected,
        actual: data.len(),
    })
}

/// ITU-R BT.601
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v, y);
    let g = 0.714_14f32.mul_add(-v, 0.344_14f32.mul_add(-u, y));
    let b = 1.772f32.mul_add(u, y);

    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
