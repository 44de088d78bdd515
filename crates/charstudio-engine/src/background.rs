use std::collections::VecDeque;
use std::io::Cursor;

use anyhow::{bail, Context, Result};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

/// Removes the backdrop behind a subject and returns PNG bytes with alpha.
///
/// `progress` receives fractions in 0-1 while the removal runs.
pub trait BackgroundRemover: Send + Sync {
    fn name(&self) -> &str;
    fn remove_background(
        &self,
        image: &[u8],
        progress: &mut dyn FnMut(f64),
    ) -> Result<Vec<u8>>;
}

pub const DEFAULT_TOLERANCE: u8 = 32;

/// Local remover for flat backdrops (the prompt asks for a white background).
///
/// The backdrop colour is the mean of the four corners. Pixels connected to
/// the border whose every channel sits within `tolerance` of it become fully
/// transparent. Enclosed regions of the same colour are kept.
#[derive(Debug, Clone)]
pub struct BorderFloodRemover {
    tolerance: u8,
}

impl BorderFloodRemover {
    pub fn new(tolerance: u8) -> Self {
        Self { tolerance }
    }
}

impl Default for BorderFloodRemover {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl BackgroundRemover for BorderFloodRemover {
    fn name(&self) -> &str {
        "border-flood"
    }

    fn remove_background(
        &self,
        image: &[u8],
        progress: &mut dyn FnMut(f64),
    ) -> Result<Vec<u8>> {
        let decoded = image::load_from_memory(image).context("failed to decode image")?;
        let mut rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        if width == 0 || height == 0 {
            bail!("image has no pixels");
        }
        progress(0.0);

        let backdrop = corner_mean(&rgba);
        let mask = self.flood_from_border(&rgba, backdrop, progress);

        let rows = height as usize;
        for y in 0..height {
            for x in 0..width {
                if mask[(y as usize) * (width as usize) + x as usize] {
                    let pixel = rgba.get_pixel_mut(x, y);
                    pixel.0[3] = 0;
                }
            }
            progress(0.5 + 0.4 * ((y as usize + 1) as f64 / rows as f64));
        }

        let mut png = Vec::new();
        DynamicImage::ImageRgba8(rgba)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("failed to encode transparent PNG")?;
        progress(1.0);
        Ok(png)
    }
}

impl BorderFloodRemover {
    fn matches(&self, pixel: &Rgba<u8>, backdrop: [u8; 3]) -> bool {
        pixel.0[..3]
            .iter()
            .zip(backdrop.iter())
            .all(|(value, reference)| value.abs_diff(*reference) <= self.tolerance)
    }

    /// Marks border-connected backdrop pixels. Reports 0-0.5 of the total.
    fn flood_from_border(
        &self,
        rgba: &RgbaImage,
        backdrop: [u8; 3],
        progress: &mut dyn FnMut(f64),
    ) -> Vec<bool> {
        let (width, height) = rgba.dimensions();
        let (w, h) = (width as usize, height as usize);
        let total = w * h;
        let mut mask = vec![false; total];
        let mut queue: VecDeque<(u32, u32)> = VecDeque::new();

        let seed = |x: u32, y: u32, mask: &mut Vec<bool>, queue: &mut VecDeque<(u32, u32)>| {
            let index = (y as usize) * w + x as usize;
            if !mask[index] && self.matches(rgba.get_pixel(x, y), backdrop) {
                mask[index] = true;
                queue.push_back((x, y));
            }
        };
        for x in 0..width {
            seed(x, 0, &mut mask, &mut queue);
            seed(x, height - 1, &mut mask, &mut queue);
        }
        for y in 0..height {
            seed(0, y, &mut mask, &mut queue);
            seed(width - 1, y, &mut mask, &mut queue);
        }

        let report_every = (total / 20).max(1);
        let mut visited = 0usize;
        while let Some((x, y)) = queue.pop_front() {
            visited += 1;
            if visited % report_every == 0 {
                progress(0.5 * (visited as f64 / total as f64));
            }
            let neighbours = [
                (x.checked_sub(1), Some(y)),
                (x.checked_add(1).filter(|nx| *nx < width), Some(y)),
                (Some(x), y.checked_sub(1)),
                (Some(x), y.checked_add(1).filter(|ny| *ny < height)),
            ];
            for (nx, ny) in neighbours {
                if let (Some(nx), Some(ny)) = (nx, ny) {
                    seed(nx, ny, &mut mask, &mut queue);
                }
            }
        }
        progress(0.5);
        mask
    }
}

fn corner_mean(rgba: &RgbaImage) -> [u8; 3] {
    let (width, height) = rgba.dimensions();
    let corners = [
        rgba.get_pixel(0, 0),
        rgba.get_pixel(width - 1, 0),
        rgba.get_pixel(0, height - 1),
        rgba.get_pixel(width - 1, height - 1),
    ];
    let mut mean = [0u8; 3];
    for (channel, slot) in mean.iter_mut().enumerate() {
        let sum: u32 = corners.iter().map(|pixel| u32::from(pixel.0[channel])).sum();
        *slot = (sum / corners.len() as u32) as u8;
    }
    mean
}
