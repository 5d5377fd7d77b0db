//! Decoded image frames
//!
//! Still images decode to a single frame. Animated GIF, APNG and WebP decode
//! to every frame, composited to full canvas size by the `image` crate.

use crate::error::AnalysisError;
use image::{AnimationDecoder, ImageFormat, RgbaImage};
use std::io::Cursor;
use tracing::debug;

/// One decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position in the original sequence
    pub index: usize,
    /// Presentation time from the start of the animation
    pub timestamp_ms: u64,
    pub image: RgbaImage,
}

impl Frame {
    pub fn new(index: usize, timestamp_ms: u64, image: RgbaImage) -> Self {
        Self {
            index,
            timestamp_ms,
            image,
        }
    }
}

/// Decoded input handed read-only to waves
#[derive(Debug, Clone)]
pub struct AnalysisImage {
    /// Container format name, lowercase (e.g. "png", "gif")
    pub format: String,
    pub width: u32,
    pub height: u32,
    /// Size of the encoded input
    pub byte_len: usize,
    /// Frame count before deduplication
    pub original_frame_count: usize,
    /// Representative frames (all frames until deduplicated)
    pub frames: Vec<Frame>,
}

impl AnalysisImage {
    /// Decode raw bytes; any failure is a critical decode failure
    pub fn decode(bytes: &[u8]) -> Result<Self, AnalysisError> {
        let format = image::guess_format(bytes)
            .map_err(|e| AnalysisError::CriticalDecodeFailure(e.to_string()))?;

        let frames = match format {
            ImageFormat::Gif => decode_gif(bytes)?,
            ImageFormat::Png => decode_png(bytes)?,
            ImageFormat::WebP => decode_webp(bytes)?,
            _ => vec![decode_still(bytes, format)?],
        };

        if frames.is_empty() {
            return Err(AnalysisError::CriticalDecodeFailure(
                "image contains no frames".to_string(),
            ));
        }

        let name = format_name(format);
        debug!(format = %name, frames = frames.len(), "Image decoded");
        Ok(Self::from_frames(name, bytes.len(), frames))
    }

    /// Build from already-decoded frames
    pub fn from_frames(format: impl Into<String>, byte_len: usize, frames: Vec<Frame>) -> Self {
        let (width, height) = frames
            .first()
            .map(|f| f.image.dimensions())
            .unwrap_or((0, 0));
        Self {
            format: format.into(),
            width,
            height,
            byte_len,
            original_frame_count: frames.len(),
            frames,
        }
    }

    /// Single-frame image
    pub fn from_rgba(image: RgbaImage) -> Self {
        Self::from_frames("raw", 0, vec![Frame::new(0, 0, image)])
    }

    pub fn is_animated(&self) -> bool {
        self.original_frame_count > 1
    }

    /// First representative frame
    pub fn primary(&self) -> Option<&Frame> {
        self.frames.first()
    }

    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            0.0
        } else {
            f64::from(self.width) / f64::from(self.height)
        }
    }
}

fn format_name(format: ImageFormat) -> String {
    format
        .extensions_str()
        .first()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{:?}", format).to_lowercase())
}

fn decode_err(e: image::ImageError) -> AnalysisError {
    AnalysisError::CriticalDecodeFailure(e.to_string())
}

fn decode_still(bytes: &[u8], format: ImageFormat) -> Result<Frame, AnalysisError> {
    let image = image::load_from_memory_with_format(bytes, format).map_err(decode_err)?;
    Ok(Frame::new(0, 0, image.to_rgba8()))
}

fn collect_animation<'a>(decoder: impl AnimationDecoder<'a>) -> Result<Vec<Frame>, AnalysisError> {
    let mut frames = Vec::new();
    let mut elapsed_ms: u64 = 0;
    for (index, frame) in decoder.into_frames().enumerate() {
        let frame = frame.map_err(decode_err)?;
        let (numer, denom) = frame.delay().numer_denom_ms();
        let delay_ms = if denom == 0 { 0 } else { u64::from(numer / denom) };
        frames.push(Frame::new(index, elapsed_ms, frame.into_buffer()));
        elapsed_ms += delay_ms;
    }
    Ok(frames)
}

fn decode_gif(bytes: &[u8]) -> Result<Vec<Frame>, AnalysisError> {
    let decoder = image::codecs::gif::GifDecoder::new(Cursor::new(bytes)).map_err(decode_err)?;
    collect_animation(decoder)
}

fn decode_png(bytes: &[u8]) -> Result<Vec<Frame>, AnalysisError> {
    let decoder = image::codecs::png::PngDecoder::new(Cursor::new(bytes)).map_err(decode_err)?;
    if decoder.is_apng().map_err(decode_err)? {
        collect_animation(decoder.apng().map_err(decode_err)?)
    } else {
        Ok(vec![decode_still(bytes, ImageFormat::Png)?])
    }
}

fn decode_webp(bytes: &[u8]) -> Result<Vec<Frame>, AnalysisError> {
    let decoder = image::codecs::webp::WebPDecoder::new(Cursor::new(bytes)).map_err(decode_err)?;
    if decoder.has_animation() {
        collect_animation(decoder)
    } else {
        Ok(vec![decode_still(bytes, ImageFormat::WebP)?])
    }
}
