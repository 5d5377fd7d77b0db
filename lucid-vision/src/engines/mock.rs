//! Scripted engines for tests and offline runs

use super::{bounded, CallOptions, OcrEngine, OcrRegion, VisionModel};
use crate::error::EngineError;
use async_trait::async_trait;
use image::RgbaImage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// OCR engine returning fixed regions
#[derive(Debug, Default)]
pub struct MockOcr {
    regions: Vec<OcrRegion>,
    /// Per-call answers; calls past the end read nothing
    script: Option<Vec<Vec<OcrRegion>>>,
    failure: Option<EngineError>,
    calls: AtomicUsize,
}

impl MockOcr {
    pub fn new(regions: Vec<OcrRegion>) -> Self {
        Self {
            regions,
            ..Self::default()
        }
    }

    /// One region per line, all with `confidence`
    pub fn with_lines(lines: &[&str], confidence: f64) -> Self {
        Self::new(lines.iter().map(|l| OcrRegion::new(*l, confidence)).collect())
    }

    /// The nth call answers `script[n]`, so frame `n` of a sequence reads
    /// its own regions
    pub fn scripted(script: Vec<Vec<OcrRegion>>) -> Self {
        Self {
            script: Some(script),
            ..Self::default()
        }
    }

    pub fn failing(error: EngineError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self::failing(EngineError::Unavailable("mock OCR not installed".to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for MockOcr {
    fn name(&self) -> &str {
        "mock-ocr"
    }

    async fn extract(&self, _image: &RgbaImage) -> Result<Vec<OcrRegion>, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match (&self.failure, &self.script) {
            (Some(err), _) => Err(err.clone()),
            (None, Some(script)) => Ok(script.get(call).cloned().unwrap_or_default()),
            (None, None) => Ok(self.regions.clone()),
        }
    }
}

/// Vision model with canned answers and per-operation call counters
#[derive(Debug)]
pub struct MockVision {
    caption: String,
    correction: Option<String>,
    embedding: Vec<f32>,
    failure: Option<EngineError>,
    delay: Option<Duration>,
    describe_calls: AtomicUsize,
    correct_calls: AtomicUsize,
    embed_calls: AtomicUsize,
    /// Dimensions of every image handed to `correct_text`
    corrected_images: Mutex<Vec<(u32, u32)>>,
    /// Dimensions of every image handed to `embed`
    embedded_images: Mutex<Vec<(u32, u32)>>,
}

impl Default for MockVision {
    fn default() -> Self {
        Self {
            caption: "a test image".to_string(),
            correction: None,
            embedding: vec![0.1, 0.2, 0.3],
            failure: None,
            delay: None,
            describe_calls: AtomicUsize::new(0),
            correct_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
            corrected_images: Mutex::new(Vec::new()),
            embedded_images: Mutex::new(Vec::new()),
        }
    }
}

impl MockVision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = caption.into();
        self
    }

    /// Fixed answer for `correct_text`; without one the candidate is echoed
    pub fn with_correction(mut self, text: impl Into<String>) -> Self {
        self.correction = Some(text.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn failing(mut self, error: EngineError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Sleep before answering; combined with a short call timeout this
    /// simulates a hung model
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn correct_calls(&self) -> usize {
        self.correct_calls.load(Ordering::SeqCst)
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn corrected_images(&self) -> Vec<(u32, u32)> {
        self.corrected_images.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn embedded_images(&self) -> Vec<(u32, u32)> {
        self.embedded_images.lock().map(|v| v.clone()).unwrap_or_default()
    }

    fn record(list: &Mutex<Vec<(u32, u32)>>, image: &RgbaImage) {
        if let Ok(mut seen) = list.lock() {
            seen.push(image.dimensions());
        }
    }

    async fn answer<T>(&self, opts: &CallOptions, value: T) -> Result<T, EngineError>
    where
        T: Send,
    {
        bounded(opts, async {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.failure {
                Some(err) => Err(err.clone()),
                None => Ok(value),
            }
        })
        .await
    }
}

#[async_trait]
impl VisionModel for MockVision {
    fn name(&self) -> &str {
        "mock-vision"
    }

    async fn describe(&self, _image: &RgbaImage, opts: &CallOptions) -> Result<String, EngineError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(opts, self.caption.clone()).await
    }

    async fn correct_text(
        &self,
        image: &RgbaImage,
        candidate: &str,
        opts: &CallOptions,
    ) -> Result<String, EngineError> {
        self.correct_calls.fetch_add(1, Ordering::SeqCst);
        Self::record(&self.corrected_images, image);
        let text = self
            .correction
            .clone()
            .unwrap_or_else(|| candidate.to_string());
        self.answer(opts, text).await
    }

    async fn embed(&self, image: &RgbaImage, opts: &CallOptions) -> Result<Vec<f32>, EngineError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        Self::record(&self.embedded_images, image);
        self.answer(opts, self.embedding.clone()).await
    }
}
