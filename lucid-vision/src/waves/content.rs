//! Content wave: text likelihood and screenshot profile

use crate::config::AnalysisConfig;
use crate::error::WaveError;
use crate::heuristics::GrayBuffer;
use crate::ledger::SignalLedger;
use crate::types::{keys, tags, Signal};
use crate::wave::{Wave, WaveContext};
use async_trait::async_trait;

pub const NAME: &str = "content";

/// Whether ledger signals describe a software screenshot
///
/// Uses only `color.flat_ratio`, `quality.edge_density` and
/// `identity.aspect_ratio` already in the ledger. Missing signals never match.
pub fn screenshot_profile_holds(ledger: &SignalLedger, config: &AnalysisConfig) -> bool {
    let profile = &config.screenshot;
    let (Some(flat), Some(edges), Some(aspect)) = (
        ledger.best_f64(keys::COLOR_FLAT_RATIO),
        ledger.best_f64(keys::QUALITY_EDGE_DENSITY),
        ledger.best_f64(keys::IDENTITY_ASPECT_RATIO),
    ) else {
        return false;
    };
    flat >= profile.min_flat_ratio
        && edges >= profile.min_edge_density
        && aspect >= profile.min_aspect_ratio
}

#[derive(Debug, Default)]
pub struct ContentWave;

#[async_trait]
impl Wave for ContentWave {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        80
    }

    async fn run(&self, ctx: &WaveContext, ledger: &SignalLedger) -> Result<Vec<Signal>, WaveError> {
        let image = ctx.image()?;
        let likelihood = image
            .frames
            .iter()
            .map(|f| GrayBuffer::from_rgba(&f.image, ctx.config.downsample_width).text_likeliness())
            .fold(0.0, f64::max);
        let screenshot = screenshot_profile_holds(ledger, &ctx.config);

        Ok(vec![
            Signal::new(keys::CONTENT_TEXT_LIKELIHOOD, likelihood, 0.7, NAME)
                .with_tag(tags::CONTENT),
            Signal::new(keys::CONTENT_SCREENSHOT_PROFILE, screenshot, 0.7, NAME)
                .with_tag(tags::CONTENT),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationConfig;
    use std::sync::Arc;

    fn ledger_with(flat: f64, edges: f64, aspect: f64) -> SignalLedger {
        let ledger = SignalLedger::new("h", Arc::new(AggregationConfig::default()));
        ledger.record("color", Signal::new(keys::COLOR_FLAT_RATIO, flat, 0.9, "color"));
        ledger.record("quality", Signal::new(keys::QUALITY_EDGE_DENSITY, edges, 0.9, "quality"));
        ledger.record("identity", Signal::new(keys::IDENTITY_ASPECT_RATIO, aspect, 1.0, "identity"));
        ledger
    }

    #[test]
    fn test_screenshot_profile() {
        let config = AnalysisConfig::default();
        assert!(screenshot_profile_holds(&ledger_with(0.6, 0.08, 16.0 / 9.0), &config));
        assert!(!screenshot_profile_holds(&ledger_with(0.2, 0.08, 16.0 / 9.0), &config));
        assert!(!screenshot_profile_holds(&ledger_with(0.6, 0.08, 1.0), &config));

        let empty = SignalLedger::new("h", Arc::new(AggregationConfig::default()));
        assert!(!screenshot_profile_holds(&empty, &config));
    }
}
