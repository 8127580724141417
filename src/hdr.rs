//! Radiance `.hdr` input and output.
//!
//! Sources are decoded to 4-channel f32 (alpha forced to 1). Faces are written back as RGB
//! Radiance files; alpha is dropped since the format has no alpha channel.

use glam::Vec4;
use image::codecs::hdr::HdrEncoder;
use image::Rgb;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// A decoded float RGBA image, rows top to bottom.
#[derive(Clone, Debug)]
pub struct HdrImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<f32>,
}

impl HdrImage {
    pub fn new(width: u32, height: u32, pixels: Vec<f32>) -> Result<Self, String> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(format!(
                "Invalid HDR image: {}x{} with {} floats (expected {})",
                width,
                height,
                pixels.len(),
                expected
            ));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Fill a `width` x `height` image from a per-texel function of (x, y).
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> Vec4) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&f(x, y).to_array());
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Vec4 {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Vec4::from_slice(&self.pixels[i..i + 4])
    }

    /// Raw bytes for upload as R32G32B32A32_SFLOAT.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels)
    }
}

/// Decode an HDR file into RGBA floats.
pub fn load_hdr(path: &Path) -> Result<HdrImage, String> {
    let img = image::open(path)
        .map_err(|e| format!("Failed to decode {}: {}", path.display(), e))?;
    let rgba = img.to_rgba32f();
    let (width, height) = rgba.dimensions();
    HdrImage::new(width, height, rgba.into_raw())
}

/// Write RGBA floats as an RGB Radiance file.
pub fn save_hdr(path: &Path, width: u32, height: u32, rgba: &[f32]) -> Result<(), String> {
    let expected = width as usize * height as usize * 4;
    if rgba.len() != expected {
        return Err(format!(
            "Cannot save {}: {} floats for {}x{} RGBA",
            path.display(),
            rgba.len(),
            width,
            height
        ));
    }

    let rgb: Vec<Rgb<f32>> = rgba
        .chunks_exact(4)
        .map(|p| Rgb([p[0], p[1], p[2]]))
        .collect();

    let file = File::create(path)
        .map_err(|e| format!("Failed to create {}: {}", path.display(), e))?;
    HdrEncoder::new(BufWriter::new(file))
        .encode(&rgb, width as usize, height as usize)
        .map_err(|e| format!("Failed to write {}: {}", path.display(), e))
}
