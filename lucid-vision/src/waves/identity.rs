//! Identity wave: dimensions, format and frame count

use crate::error::WaveError;
use crate::ledger::SignalLedger;
use crate::types::{keys, tags, Signal};
use crate::wave::{Wave, WaveContext};
use async_trait::async_trait;

pub const NAME: &str = "identity";

#[derive(Debug, Default)]
pub struct IdentityWave;

#[async_trait]
impl Wave for IdentityWave {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        100
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &WaveContext, _ledger: &SignalLedger) -> Result<Vec<Signal>, WaveError> {
        let image = ctx.image()?;
        if image.width == 0 || image.height == 0 {
            return Err(WaveError::Failed(format!(
                "degenerate image dimensions {}x{}",
                image.width, image.height
            )));
        }

        let signal = |key: &str, value: crate::types::SignalValue| {
            Signal::new(key, value, 1.0, NAME).with_tag(tags::IDENTITY)
        };
        Ok(vec![
            signal(keys::IDENTITY_WIDTH, f64::from(image.width).into()),
            signal(keys::IDENTITY_HEIGHT, f64::from(image.height).into()),
            signal(keys::IDENTITY_ASPECT_RATIO, image.aspect_ratio().into()),
            signal(
                keys::IDENTITY_FRAME_COUNT,
                (image.original_frame_count as f64).into(),
            ),
            signal(keys::IDENTITY_FORMAT, image.format.clone().into()),
            signal(keys::IDENTITY_ANIMATED, image.is_animated().into()),
            signal(keys::IDENTITY_BYTE_LEN, (image.byte_len as f64).into()),
        ])
    }
}
