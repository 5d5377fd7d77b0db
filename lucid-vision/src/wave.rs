//! Wave contract
//!
//! A wave is one independent analysis step. It reads the decoded image and
//! signals already in the ledger, and returns new signals. The orchestrator
//! records them; waves never write to the ledger directly.

use crate::config::AnalysisConfig;
use crate::error::WaveError;
use crate::frames::AnalysisImage;
use crate::ledger::SignalLedger;
use crate::types::Signal;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Read-only inputs lent to a running wave
#[derive(Debug, Clone)]
pub struct WaveContext {
    image: Option<Arc<AnalysisImage>>,
    pub config: Arc<AnalysisConfig>,
    /// SHA-256 of the raw input bytes
    pub content_hash: String,
    pub cancel: CancellationToken,
}

impl WaveContext {
    pub fn new(
        image: Option<Arc<AnalysisImage>>,
        config: Arc<AnalysisConfig>,
        content_hash: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            image,
            config,
            content_hash: content_hash.into(),
            cancel,
        }
    }

    /// Decoded image; an error for waves that run after pixels were released
    pub fn image(&self) -> Result<&AnalysisImage, WaveError> {
        self.image
            .as_deref()
            .ok_or_else(|| WaveError::Failed("decoded image no longer available".to_string()))
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }
}

/// One analysis step
#[async_trait]
pub trait Wave: Send + Sync {
    /// Unique name, used as signal source and contributor
    fn name(&self) -> &str;

    /// Higher runs earlier; equal priorities run concurrently
    fn priority(&self) -> i32;

    /// A failing critical wave aborts the whole analysis
    fn is_critical(&self) -> bool {
        false
    }

    /// Whether the wave reads pixels (keeps the decoded image alive)
    fn needs_pixels(&self) -> bool {
        true
    }

    /// Overrides the configured per-wave budget
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Evaluated against the ledger just before the wave's band starts
    fn should_run(&self, _ledger: &SignalLedger, _config: &AnalysisConfig) -> bool {
        true
    }

    async fn run(&self, ctx: &WaveContext, ledger: &SignalLedger) -> Result<Vec<Signal>, WaveError>;
}
