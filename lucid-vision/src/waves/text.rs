//! Text wave: runs the tiered escalator over representative frames

use super::content::screenshot_profile_holds;
use crate::config::AnalysisConfig;
use crate::error::{EngineError, WaveError};
use crate::escalation::{EscalationCap, TextEscalator};
use crate::ledger::SignalLedger;
use crate::types::{keys, tags, Signal, SignalValue};
use crate::wave::{Wave, WaveContext};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

pub const NAME: &str = "text";

/// Cap the cascade at Tier 1 unless text is likely or the image looks like
/// a screenshot; decided from signals already in the ledger
fn cap_for(ledger: &SignalLedger, config: &AnalysisConfig) -> Option<EscalationCap> {
    let likelihood = ledger
        .best_f64(keys::CONTENT_TEXT_LIKELIHOOD)
        .unwrap_or(0.0);
    if likelihood >= config.text_likelihood_threshold {
        return None;
    }
    let screenshot = screenshot_profile_holds(ledger, config);
    debug!(likelihood, screenshot, "Text likelihood below threshold");
    (!screenshot).then_some(EscalationCap::LowTextLikelihood)
}

#[derive(Debug)]
pub struct TextWave {
    escalator: TextEscalator,
    timeout: Duration,
}

impl TextWave {
    /// Budget covers Tier 1/2 plus one round of Tier-3 calls
    pub fn new(escalator: TextEscalator, config: &AnalysisConfig) -> Self {
        Self {
            escalator,
            timeout: config.wave_timeout() + config.tier3_timeout(),
        }
    }
}

#[async_trait]
impl Wave for TextWave {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        50
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn run(&self, ctx: &WaveContext, ledger: &SignalLedger) -> Result<Vec<Signal>, WaveError> {
        let image = ctx.image()?;
        let cap = cap_for(ledger, &ctx.config);
        let outcome = match cap {
            Some(cap) => self.escalator.escalate_capped(&image.frames, cap).await,
            None => {
                self.escalator
                    .escalate(&image.frames, &ctx.content_hash, &ctx.cancel)
                    .await
            }
        };
        match outcome {
            Ok(Some(result)) => Ok(result.to_signals(NAME)),
            Ok(None) => {
                let mut signals = vec![Signal::new(
                    keys::OCR_REGIONS,
                    SignalValue::Record(serde_json::Value::Array(Vec::new())),
                    1.0,
                    NAME,
                )
                .with_tag(tags::OCR)
                .with_meta("count", 0usize)];
                if let Some(cap) = cap {
                    signals.push(cap.to_signal(NAME));
                }
                Ok(signals)
            }
            Err(EngineError::Unavailable(msg)) => {
                warn!(error = %msg, "OCR engine unavailable, no text signal recorded");
                Ok(vec![Signal::failure(keys::OCR_UNAVAILABLE, NAME, msg)
                    .with_tag(tags::OCR)
                    .with_meta("error_kind", "engine_unavailable")])
            }
            Err(EngineError::Cancelled) => Err(WaveError::Cancelled),
            Err(e) => Err(WaveError::Engine(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationConfig;
    use std::sync::Arc;

    fn ledger(likelihood: f64, flat: f64) -> SignalLedger {
        let ledger = SignalLedger::new("h", Arc::new(AggregationConfig::default()));
        ledger.record(
            "content",
            Signal::new(keys::CONTENT_TEXT_LIKELIHOOD, likelihood, 0.7, "content"),
        );
        ledger.record("color", Signal::new(keys::COLOR_FLAT_RATIO, flat, 0.9, "color"));
        ledger.record("quality", Signal::new(keys::QUALITY_EDGE_DENSITY, 0.08, 0.9, "quality"));
        ledger.record(
            "identity",
            Signal::new(keys::IDENTITY_ASPECT_RATIO, 16.0 / 9.0, 1.0, "identity"),
        );
        ledger
    }

    #[test]
    fn test_cap_follows_likelihood_and_screenshot_override() {
        let config = AnalysisConfig::default();
        assert_eq!(cap_for(&ledger(0.9, 0.0), &config), None);
        assert_eq!(
            cap_for(&ledger(0.05, 0.0), &config),
            Some(EscalationCap::LowTextLikelihood)
        );
        // Flat, edgy, wide: screenshot profile forces the full cascade
        assert_eq!(cap_for(&ledger(0.05, 0.6), &config), None);
    }
}
