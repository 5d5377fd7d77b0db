//! Fast pixel heuristics
//!
//! All measures run on a grayscale copy downsampled to a fixed width, so their
//! cost does not grow with input resolution. Every score is normalised to
//! 0.0-1.0.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};
use std::collections::HashMap;

/// SSIM window edge
const WINDOW: u32 = 8;
/// Gradient magnitude (0-255 scale) above which a pixel counts as an edge
const EDGE_THRESHOLD: f64 = 48.0;
/// Gradient magnitude at or below which a pixel counts as flat
const FLAT_THRESHOLD: f64 = 2.0;
/// Luminance transitions per row that suggest a line of glyphs
const ROW_TRANSITIONS: usize = 6;

/// Downsampled grayscale copy of a frame
#[derive(Debug, Clone, PartialEq)]
pub struct GrayBuffer {
    image: GrayImage,
}

impl GrayBuffer {
    /// Convert to gray and shrink to at most `target_width`, keeping aspect
    pub fn from_rgba(image: &RgbaImage, target_width: u32) -> Self {
        let gray = imageops::grayscale(image);
        let (w, h) = gray.dimensions();
        if w <= target_width || w == 0 {
            return Self { image: gray };
        }
        let new_h = ((u64::from(h) * u64::from(target_width)) / u64::from(w)).max(1) as u32;
        Self {
            image: imageops::resize(&gray, target_width, new_h, FilterType::Triangle),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    fn at(&self, x: u32, y: u32) -> f64 {
        f64::from(self.image.get_pixel(x, y)[0])
    }

    /// Central-difference gradient magnitude at an interior pixel
    fn gradient(&self, x: u32, y: u32) -> f64 {
        let dx = self.at(x + 1, y) - self.at(x - 1, y);
        let dy = self.at(x, y + 1) - self.at(x, y - 1);
        (dx * dx + dy * dy).sqrt() / 2.0
    }

    fn interior(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let (w, h) = (self.width(), self.height());
        (1..h.saturating_sub(1)).flat_map(move |y| (1..w.saturating_sub(1)).map(move |x| (x, y)))
    }

    fn interior_len(&self) -> usize {
        (self.width().saturating_sub(2) as usize) * (self.height().saturating_sub(2) as usize)
    }

    /// Fraction of interior pixels whose gradient exceeds the edge threshold
    pub fn edge_density(&self) -> f64 {
        let total = self.interior_len();
        if total == 0 {
            return 0.0;
        }
        let edges = self
            .interior()
            .filter(|&(x, y)| self.gradient(x, y) > EDGE_THRESHOLD)
            .count();
        edges as f64 / total as f64
    }

    /// Fraction of interior pixels sitting in a region of uniform colour
    pub fn flat_ratio(&self) -> f64 {
        let total = self.interior_len();
        if total == 0 {
            return 1.0;
        }
        let flat = self
            .interior()
            .filter(|&(x, y)| self.gradient(x, y) <= FLAT_THRESHOLD)
            .count();
        flat as f64 / total as f64
    }

    /// Mean 8x8 block variance, normalised against the maximum possible
    pub fn local_variance(&self) -> f64 {
        let blocks = self.blocks();
        if blocks.is_empty() {
            return 0.0;
        }
        let mean_var = blocks
            .iter()
            .map(|&(bx, by)| {
                let (_, var) = self.block_stats(bx, by);
                var
            })
            .sum::<f64>()
            / blocks.len() as f64;
        // Max variance of 8-bit values is 127.5^2
        (mean_var / (127.5 * 127.5)).clamp(0.0, 1.0)
    }

    /// Variance of the Laplacian, mapped onto 0.0-1.0
    pub fn sharpness(&self) -> f64 {
        let total = self.interior_len();
        if total == 0 {
            return 0.0;
        }
        let values: Vec<f64> = self
            .interior()
            .map(|(x, y)| {
                self.at(x + 1, y) + self.at(x - 1, y) + self.at(x, y + 1) + self.at(x, y - 1)
                    - 4.0 * self.at(x, y)
            })
            .collect();
        let mean = values.iter().sum::<f64>() / total as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / total as f64;
        1.0 - (-var / 500.0).exp()
    }

    /// Likelihood that the frame carries rendered text
    ///
    /// Combines edge density with the fraction of rows showing many light/dark
    /// transitions, the signature of a line of glyphs.
    pub fn text_likeliness(&self) -> f64 {
        let (w, h) = (self.width(), self.height());
        if w < 2 || h == 0 {
            return 0.0;
        }
        let edge_score = (self.edge_density() / 0.15).min(1.0);

        let mut text_rows = 0usize;
        for y in 0..h {
            let row: Vec<f64> = (0..w).map(|x| self.at(x, y)).collect();
            let mean = row.iter().sum::<f64>() / row.len() as f64;
            let contrast = row.iter().map(|v| (v - mean).abs()).sum::<f64>() / row.len() as f64;
            if contrast < 8.0 {
                continue;
            }
            let transitions = row
                .windows(2)
                .filter(|p| (p[0] > mean) != (p[1] > mean))
                .count();
            if transitions >= ROW_TRANSITIONS {
                text_rows += 1;
            }
        }
        let row_score = text_rows as f64 / f64::from(h);

        (0.5 * edge_score + 0.5 * row_score).clamp(0.0, 1.0)
    }

    fn blocks(&self) -> Vec<(u32, u32)> {
        let bw = self.width() / WINDOW;
        let bh = self.height() / WINDOW;
        (0..bh).flat_map(|by| (0..bw).map(move |bx| (bx, by))).collect()
    }

    /// (mean, variance) of one 8x8 block
    fn block_stats(&self, bx: u32, by: u32) -> (f64, f64) {
        let n = f64::from(WINDOW * WINDOW);
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for y in by * WINDOW..(by + 1) * WINDOW {
            for x in bx * WINDOW..(bx + 1) * WINDOW {
                let v = self.at(x, y);
                sum += v;
                sum_sq += v * v;
            }
        }
        let mean = sum / n;
        (mean, (sum_sq / n - mean * mean).max(0.0))
    }
}

/// Mean SSIM over non-overlapping 8x8 windows
///
/// Buffers of different dimensions are not comparable and score 0.0. Buffers
/// smaller than one window are compared pixel-for-pixel.
pub fn ssim(a: &GrayBuffer, b: &GrayBuffer) -> f64 {
    if a.width() != b.width() || a.height() != b.height() {
        return 0.0;
    }
    const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
    const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

    let blocks = a.blocks();
    if blocks.is_empty() {
        return if a == b { 1.0 } else { 0.0 };
    }

    let n = f64::from(WINDOW * WINDOW);
    let mut total = 0.0;
    for &(bx, by) in &blocks {
        let (mu_a, var_a) = a.block_stats(bx, by);
        let (mu_b, var_b) = b.block_stats(bx, by);
        let mut cov = 0.0;
        for y in by * WINDOW..(by + 1) * WINDOW {
            for x in bx * WINDOW..(bx + 1) * WINDOW {
                cov += (a.at(x, y) - mu_a) * (b.at(x, y) - mu_b);
            }
        }
        cov /= n;
        total += ((2.0 * mu_a * mu_b + C1) * (2.0 * cov + C2))
            / ((mu_a * mu_a + mu_b * mu_b + C1) * (var_a + var_b + C2));
    }
    (total / blocks.len() as f64).clamp(0.0, 1.0)
}

/// Colour statistics over a downsampled RGBA copy
#[derive(Debug, Clone, PartialEq)]
pub struct ColorStats {
    /// Mean Rec. 601 luma, 0.0-1.0
    pub mean_luma: f64,
    /// Most common 3-bit-per-channel colour bucket, as `#rrggbb`
    pub dominant: String,
    /// Share of pixels falling in the dominant bucket
    pub dominant_share: f64,
    pub is_grayscale: bool,
}

pub fn color_stats(image: &RgbaImage, target_width: u32) -> ColorStats {
    let (w, h) = image.dimensions();
    let small = if w > target_width && w > 0 {
        let new_h = ((u64::from(h) * u64::from(target_width)) / u64::from(w)).max(1) as u32;
        imageops::resize(image, target_width, new_h, FilterType::Triangle)
    } else {
        image.clone()
    };

    let total = small.pixels().len();
    if total == 0 {
        return ColorStats {
            mean_luma: 0.0,
            dominant: "#000000".to_string(),
            dominant_share: 0.0,
            is_grayscale: true,
        };
    }

    let mut luma_sum = 0.0;
    let mut chroma_pixels = 0usize;
    let mut buckets: HashMap<(u8, u8, u8), usize> = HashMap::new();
    for p in small.pixels() {
        let [r, g, b, _] = p.0;
        luma_sum += 0.299 * f64::from(r) + 0.587 * f64::from(g) + 0.114 * f64::from(b);
        let spread = r.max(g).max(b) - r.min(g).min(b);
        if spread > 12 {
            chroma_pixels += 1;
        }
        *buckets.entry((r >> 5, g >> 5, b >> 5)).or_default() += 1;
    }

    // Ties broken by bucket value so the result is deterministic
    let ((r, g, b), count) = buckets
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .unwrap_or(((0, 0, 0), 0));
    let center = |v: u8| (v << 5) | 0x10;

    ColorStats {
        mean_luma: luma_sum / total as f64 / 255.0,
        dominant: format!("#{:02x}{:02x}{:02x}", center(r), center(g), center(b)),
        dominant_share: count as f64 / total as f64,
        is_grayscale: (chroma_pixels as f64 / total as f64) < 0.01,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(w: u32, h: u32, v: u8) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([v, v, v, 255]))
    }

    /// Alternating dark glyph-like bars on white
    fn striped(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            if (x / 3) % 2 == 0 && (y / 6) % 2 == 0 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        })
    }

    #[test]
    fn test_downsample_keeps_aspect() {
        let buf = GrayBuffer::from_rgba(&solid(1024, 512, 10), 256);
        assert_eq!((buf.width(), buf.height()), (256, 128));

        let small = GrayBuffer::from_rgba(&solid(100, 50, 10), 256);
        assert_eq!((small.width(), small.height()), (100, 50));
    }

    #[test]
    fn test_solid_frame_scores() {
        let buf = GrayBuffer::from_rgba(&solid(64, 64, 200), 256);
        assert_eq!(buf.edge_density(), 0.0);
        assert_eq!(buf.flat_ratio(), 1.0);
        assert_eq!(buf.local_variance(), 0.0);
        assert_eq!(buf.sharpness(), 0.0);
        assert_eq!(buf.text_likeliness(), 0.0);
    }

    #[test]
    fn test_striped_frame_looks_like_text() {
        let buf = GrayBuffer::from_rgba(&striped(128, 64), 256);
        assert!(buf.edge_density() > 0.1);
        assert!(buf.sharpness() > 0.5);
        assert!(buf.text_likeliness() > 0.5);
    }

    #[test]
    fn test_ssim_identity_and_difference() {
        let a = GrayBuffer::from_rgba(&striped(64, 64), 256);
        let b = GrayBuffer::from_rgba(&solid(64, 64, 128), 256);
        assert!((ssim(&a, &a) - 1.0).abs() < 1e-9);
        assert!(ssim(&a, &b) < 0.5);

        let c = GrayBuffer::from_rgba(&solid(32, 64, 128), 256);
        assert_eq!(ssim(&a, &c), 0.0);
    }

    #[test]
    fn test_color_stats() {
        let stats = color_stats(&solid(10, 10, 255), 256);
        assert!((stats.mean_luma - 1.0).abs() < 1e-3);
        assert!(stats.is_grayscale);
        assert_eq!(stats.dominant_share, 1.0);

        let red = RgbaImage::from_pixel(10, 10, Rgba([250, 0, 0, 255]));
        let stats = color_stats(&red, 256);
        assert!(!stats.is_grayscale);
        assert_eq!(stats.dominant, "#f01010");
    }
}
