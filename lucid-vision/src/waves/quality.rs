//! Quality wave: sharpness, edge density and local variance
//!
//! Measures are averaged over all representative frames.

use crate::error::WaveError;
use crate::heuristics::GrayBuffer;
use crate::ledger::SignalLedger;
use crate::types::{keys, tags, Signal};
use crate::wave::{Wave, WaveContext};
use async_trait::async_trait;

pub const NAME: &str = "quality";

#[derive(Debug, Default)]
pub struct QualityWave;

#[async_trait]
impl Wave for QualityWave {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        90
    }

    async fn run(&self, ctx: &WaveContext, _ledger: &SignalLedger) -> Result<Vec<Signal>, WaveError> {
        let image = ctx.image()?;
        if image.frames.is_empty() {
            return Err(WaveError::Failed("no frames".to_string()));
        }

        let (mut sharpness, mut edges, mut variance) = (0.0, 0.0, 0.0);
        for frame in &image.frames {
            let gray = GrayBuffer::from_rgba(&frame.image, ctx.config.downsample_width);
            sharpness += gray.sharpness();
            edges += gray.edge_density();
            variance += gray.local_variance();
        }
        let n = image.frames.len() as f64;

        Ok(vec![
            Signal::new(keys::QUALITY_SHARPNESS, sharpness / n, 0.85, NAME)
                .with_tag(tags::QUALITY)
                .with_meta("frames", image.frames.len()),
            Signal::new(keys::QUALITY_EDGE_DENSITY, edges / n, 0.9, NAME).with_tag(tags::QUALITY),
            Signal::new(keys::QUALITY_LOCAL_VARIANCE, variance / n, 0.9, NAME)
                .with_tag(tags::QUALITY),
        ])
    }
}
