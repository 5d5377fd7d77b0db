//! Tier 1: OCR over representative frames

use crate::engines::{OcrEngine, OcrRegion};
use crate::error::EngineError;
use crate::frames::Frame;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Merged OCR reading of all representative frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier1Result {
    /// Distinct lines joined with newlines, first-seen order
    pub text: String,
    pub regions: Vec<OcrRegion>,
    pub mean_confidence: f64,
    /// Share of non-whitespace characters that are not alphanumeric
    pub symbol_ratio: f64,
    pub malformed: bool,
    pub frames_read: usize,
}

impl Tier1Result {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Lines of `text` grouped by the frame that first showed them, in
    /// first-seen order
    ///
    /// `text` must have the same line layout as the merged reading, which
    /// holds for Tier-2 corrections. Returns `None` when it does not.
    pub fn lines_by_frame(&self, text: &str) -> Option<Vec<(usize, String)>> {
        let mut lines = text.split('\n');
        let mut groups: Vec<(usize, Vec<&str>)> = Vec::new();
        for region in &self.regions {
            let count = region.text.trim().split('\n').count();
            let taken: Vec<&str> = lines.by_ref().take(count).collect();
            if taken.len() != count {
                return None;
            }
            match groups.iter_mut().find(|(frame, _)| *frame == region.frame) {
                Some((_, group)) => group.extend(taken),
                None => groups.push((region.frame, taken)),
            }
        }
        if lines.next().is_some() {
            return None;
        }
        Some(
            groups
                .into_iter()
                .map(|(frame, group)| (frame, group.join("\n")))
                .collect(),
        )
    }
}

pub fn symbol_ratio(text: &str) -> f64 {
    let (symbols, total) = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .fold((0usize, 0usize), |(s, t), c| {
            (s + usize::from(!c.is_alphanumeric()), t + 1)
        });
    if total == 0 {
        0.0
    } else {
        symbols as f64 / total as f64
    }
}

/// Run `engine` on every frame and merge the lines
///
/// A line seen on an earlier frame is not repeated; the first occurrence
/// keeps its position and confidence.
pub async fn run(
    engine: &dyn OcrEngine,
    frames: &[Frame],
    min_confidence: f64,
    max_symbol_ratio: f64,
) -> Result<Tier1Result, EngineError> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut regions: Vec<OcrRegion> = Vec::new();

    for frame in frames {
        let found = engine.extract(&frame.image).await?;
        debug!(frame = frame.index, regions = found.len(), "Tier 1 frame read");
        for region in found {
            let line = region.text.trim();
            if line.is_empty() {
                continue;
            }
            if seen.insert(line.to_string()) {
                regions.push(region.on_frame(frame.index));
            }
        }
    }

    let text = regions
        .iter()
        .map(|r| r.text.trim())
        .collect::<Vec<_>>()
        .join("\n");
    let mean_confidence = if regions.is_empty() {
        0.0
    } else {
        regions.iter().map(|r| r.confidence).sum::<f64>() / regions.len() as f64
    };
    let symbol_ratio = symbol_ratio(&text);
    let malformed =
        !regions.is_empty() && (mean_confidence < min_confidence || symbol_ratio > max_symbol_ratio);

    Ok(Tier1Result {
        text,
        regions,
        mean_confidence,
        symbol_ratio,
        malformed,
        frames_read: frames.len(),
    })
}
