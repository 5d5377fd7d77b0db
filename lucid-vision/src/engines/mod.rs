//! External engine contracts
//!
//! OCR engines and vision models are opaque collaborators behind traits so the
//! escalator and waves can run against real backends or scripted mocks.
//! Transport errors never escape an implementation; they are mapped onto
//! [`EngineError`].

pub mod mock;
pub mod ollama;
pub mod tesseract;

use crate::error::EngineError;
use async_trait::async_trait;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use mock::{MockOcr, MockVision};
pub use ollama::OllamaVision;
pub use tesseract::TesseractOcr;

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One recognised text region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrRegion {
    pub text: String,
    /// Engine confidence, 0.0-1.0
    pub confidence: f64,
    pub bbox: BoundingBox,
    /// Original index of the frame the region was read from
    #[serde(default)]
    pub frame: usize,
}

impl OcrRegion {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox: BoundingBox::default(),
            frame: 0,
        }
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = bbox;
        self
    }

    pub fn on_frame(mut self, frame: usize) -> Self {
        self.frame = frame;
        self
    }
}

/// Tier-1 OCR backend
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Recognise text regions in reading order
    async fn extract(&self, image: &RgbaImage) -> Result<Vec<OcrRegion>, EngineError>;
}

/// Per-call limits for vision model requests
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl CallOptions {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }
}

/// Vision-language model backend
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Model identifier, part of memoization keys
    fn name(&self) -> &str;

    /// Natural-language caption for the image
    async fn describe(&self, image: &RgbaImage, opts: &CallOptions) -> Result<String, EngineError>;

    /// Corrected reading of `candidate` as it appears in the image
    async fn correct_text(
        &self,
        image: &RgbaImage,
        candidate: &str,
        opts: &CallOptions,
    ) -> Result<String, EngineError>;

    /// Embedding vector for the image
    async fn embed(&self, image: &RgbaImage, opts: &CallOptions) -> Result<Vec<f32>, EngineError>;
}

/// Race `fut` against the call timeout and cancellation
pub async fn bounded<T, F>(opts: &CallOptions, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::select! {
        biased;
        _ = opts.cancel.cancelled() => Err(EngineError::Cancelled),
        res = tokio::time::timeout(opts.timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(EngineError::Timeout(opts.timeout.as_millis() as u64)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_timeout() {
        let opts = CallOptions::new(Duration::from_millis(20), CancellationToken::new());
        let res: Result<(), EngineError> = bounded(&opts, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(res, Err(EngineError::Timeout(20)));
    }

    #[tokio::test]
    async fn test_bounded_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let opts = CallOptions::new(Duration::from_secs(5), cancel);
        let res: Result<u32, EngineError> = bounded(&opts, async { Ok(1) }).await;
        assert_eq!(res, Err(EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let opts = CallOptions::new(Duration::from_secs(5), CancellationToken::new());
        let res = bounded(&opts, async { Ok::<_, EngineError>("ok") }).await;
        assert_eq!(res, Ok("ok"));
    }
}
