//! Built-in waves
//!
//! | wave | priority | reads |
//! |---|---|---|
//! | identity | 100 | decoded image (critical) |
//! | color, quality | 90 | primary / all frames |
//! | content | 80 | frames + ledger |
//! | text | 50 | frames, OCR engine, vision model |
//! | caption | 40 | primary frame, vision model |

pub mod caption;
pub mod color;
pub mod content;
pub mod identity;
pub mod quality;
pub mod text;

pub use caption::CaptionWave;
pub use color::ColorWave;
pub use content::ContentWave;
pub use identity::IdentityWave;
pub use quality::QualityWave;
pub use text::TextWave;

use crate::config::AnalysisConfig;
use crate::engines::{OcrEngine, VisionModel};
use crate::escalation::TextEscalator;
use crate::cache::ResultCache;
use crate::wave::Wave;
use std::sync::Arc;

/// Pixel-only waves that need no external engine
pub fn heuristic_waves() -> Vec<Arc<dyn Wave>> {
    vec![
        Arc::new(IdentityWave),
        Arc::new(ColorWave),
        Arc::new(QualityWave),
        Arc::new(ContentWave),
    ]
}

/// Full wave set for the given engines
pub fn standard_waves(
    config: &Arc<AnalysisConfig>,
    ocr: Option<Arc<dyn OcrEngine>>,
    vision: Option<Arc<dyn VisionModel>>,
    cache: Option<ResultCache>,
) -> Vec<Arc<dyn Wave>> {
    let mut waves = heuristic_waves();

    if let Some(ocr) = ocr {
        let mut escalator = TextEscalator::new(ocr, Arc::clone(config));
        if let Some(vision) = &vision {
            escalator = escalator.with_vision(Arc::clone(vision));
        }
        if let Some(cache) = cache {
            escalator = escalator.with_cache(cache);
        }
        waves.push(Arc::new(TextWave::new(escalator, config)));
    }

    if let Some(vision) = vision {
        waves.push(Arc::new(CaptionWave::new(vision, config)));
    }

    waves
}
