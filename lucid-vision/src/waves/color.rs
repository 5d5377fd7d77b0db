//! Color wave: luma, flat-area ratio, dominant color

use crate::error::WaveError;
use crate::heuristics::{color_stats, GrayBuffer};
use crate::ledger::SignalLedger;
use crate::types::{keys, tags, Signal};
use crate::wave::{Wave, WaveContext};
use async_trait::async_trait;

pub const NAME: &str = "color";

#[derive(Debug, Default)]
pub struct ColorWave;

#[async_trait]
impl Wave for ColorWave {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        90
    }

    async fn run(&self, ctx: &WaveContext, _ledger: &SignalLedger) -> Result<Vec<Signal>, WaveError> {
        let image = ctx.image()?;
        let frame = image
            .primary()
            .ok_or_else(|| WaveError::Failed("no frames".to_string()))?;
        let width = ctx.config.downsample_width;

        let stats = color_stats(&frame.image, width);
        let flat_ratio = GrayBuffer::from_rgba(&frame.image, width).flat_ratio();

        Ok(vec![
            Signal::new(keys::COLOR_MEAN_LUMA, stats.mean_luma, 0.95, NAME).with_tag(tags::COLOR),
            Signal::new(keys::COLOR_FLAT_RATIO, flat_ratio, 0.9, NAME).with_tag(tags::COLOR),
            Signal::new(keys::COLOR_DOMINANT, stats.dominant, 0.8, NAME)
                .with_tag(tags::COLOR)
                .with_meta("share", stats.dominant_share),
            Signal::new(keys::COLOR_IS_GRAYSCALE, stats.is_grayscale, 0.9, NAME)
                .with_tag(tags::COLOR),
        ])
    }
}
