//! Caption wave: vision-model description and optional image embedding

use crate::config::AnalysisConfig;
use crate::engines::{CallOptions, VisionModel};
use crate::error::WaveError;
use crate::ledger::SignalLedger;
use crate::types::{keys, tags, Signal, SignalValue};
use crate::wave::{Wave, WaveContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const NAME: &str = "caption";

pub struct CaptionWave {
    vision: Arc<dyn VisionModel>,
    timeout: Duration,
}

impl std::fmt::Debug for CaptionWave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptionWave")
            .field("model", &self.vision.name())
            .finish_non_exhaustive()
    }
}

impl CaptionWave {
    pub fn new(vision: Arc<dyn VisionModel>, config: &AnalysisConfig) -> Self {
        Self {
            vision,
            timeout: config.wave_timeout() + config.tier3_timeout() * 2,
        }
    }
}

#[async_trait]
impl Wave for CaptionWave {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        40
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn should_run(&self, _ledger: &SignalLedger, config: &AnalysisConfig) -> bool {
        config.caption_enabled
    }

    async fn run(&self, ctx: &WaveContext, _ledger: &SignalLedger) -> Result<Vec<Signal>, WaveError> {
        let frame = ctx
            .image()?
            .primary()
            .ok_or_else(|| WaveError::Failed("no frames".to_string()))?;
        let opts = CallOptions::new(ctx.config.tier3_timeout(), ctx.cancel.child_token());

        let caption = self.vision.describe(&frame.image, &opts).await?;
        let mut signals = vec![Signal::new(keys::VISION_CAPTION, caption.clone(), 0.8, NAME)
            .with_tag(tags::VISION)
            .with_meta("model", self.vision.name())];

        if ctx.config.embedding_enabled {
            match self.vision.embed(&frame.image, &opts).await {
                Ok(vector) => signals.push(
                    Signal::new(
                        keys::VISION_EMBEDDING,
                        SignalValue::Record(serde_json::json!(vector)),
                        0.8,
                        NAME,
                    )
                    .with_tag(tags::VISION)
                    .with_meta("dimensions", vector.len()),
                ),
                Err(e) => warn!(error = %e, "Image embedding failed, caption kept"),
            }
        }
        Ok(signals)
    }
}
