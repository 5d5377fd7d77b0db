//! Shared fixtures for pipeline tests
//!
//! Images are encoded in memory with the `image` crate; scripted waves stand
//! in for failing, panicking or slow analyzers.

#![allow(dead_code)]

use async_trait::async_trait;
use image::codecs::gif::GifEncoder;
use image::{Delay, DynamicImage, Frame as ImageFrame, ImageFormat, Rgba, RgbaImage};
use lucid_vision::error::WaveError;
use lucid_vision::types::Signal;
use lucid_vision::{AnalysisConfig, SignalLedger, Wave, WaveContext};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn solid(width: u32, height: u32, shade: u8) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba([shade, shade, shade, 255]))
}

/// Black and white vertical stripes `band` pixels wide
pub fn stripes(width: u32, height: u32, band: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, _| {
        if (x / band) % 2 == 0 {
            Rgba([0, 0, 0, 255])
        } else {
            Rgba([255, 255, 255, 255])
        }
    })
}

pub fn png_bytes(image: &RgbaImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(image.clone())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// Animated GIF, 100ms per frame
pub fn gif_bytes(frames: &[RgbaImage]) -> Vec<u8> {
    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut bytes);
        for buffer in frames {
            let frame =
                ImageFrame::from_parts(buffer.clone(), 0, 0, Delay::from_numer_denom_ms(100, 1));
            encoder.encode_frame(frame).unwrap();
        }
    }
    bytes
}

/// Config whose text wave runs on any image
pub fn text_config() -> AnalysisConfig {
    AnalysisConfig {
        text_likelihood_threshold: 0.0,
        ..AnalysisConfig::default()
    }
}

/// How a scripted wave behaves
#[derive(Debug, Clone)]
pub enum Script {
    Emit(Vec<Signal>),
    Fail(String),
    Panic,
    Sleep(Duration),
}

/// Wave that follows a fixed script
#[derive(Debug)]
pub struct ScriptedWave {
    pub name: String,
    pub priority: i32,
    pub critical: bool,
    pub timeout: Option<Duration>,
    pub script: Script,
    pub runs: AtomicUsize,
}

impl ScriptedWave {
    pub fn new(name: &str, priority: i32, script: Script) -> Self {
        Self {
            name: name.to_string(),
            priority,
            critical: false,
            timeout: None,
            script,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Wave for ScriptedWave {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    fn needs_pixels(&self) -> bool {
        false
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run(&self, _ctx: &WaveContext, _ledger: &SignalLedger) -> Result<Vec<Signal>, WaveError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Emit(signals) => Ok(signals.clone()),
            Script::Fail(msg) => Err(WaveError::Failed(msg.clone())),
            Script::Panic => panic!("scripted wave panic"),
            Script::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(Vec::new())
            }
        }
    }
}

/// Wave that copies the resolved `identity.width` into `echo.width`
#[derive(Debug, Default)]
pub struct WidthEchoWave;

#[async_trait]
impl Wave for WidthEchoWave {
    fn name(&self) -> &str {
        "echo"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn needs_pixels(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &WaveContext, ledger: &SignalLedger) -> Result<Vec<Signal>, WaveError> {
        let width = ledger
            .best_f64(lucid_vision::types::keys::IDENTITY_WIDTH)
            .ok_or_else(|| WaveError::Failed("identity.width missing".to_string()))?;
        Ok(vec![
            Signal::new("echo.width", width, 1.0, "echo"),
            Signal::new("echo.has_image", ctx.has_image(), 1.0, "echo"),
        ])
    }
}

pub fn arc<W: Wave + 'static>(wave: W) -> Arc<dyn Wave> {
    Arc::new(wave)
}
