//! Frame deduplication
//!
//! Reduces an animation to representative frames. Each frame is compared with
//! the representative of the most recent cluster only:
//!
//! - similarity below `duplicate_threshold` starts a new cluster
//! - otherwise the frame replaces the representative when its text quality is
//!   better by more than `replacement_margin`
//! - otherwise the frame is discarded
//!
//! Output order follows first appearance of each cluster and is never longer
//! than the input.

use crate::frames::Frame;
use crate::heuristics::{ssim, GrayBuffer};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Per-frame measures used by the deduplicator
pub trait FrameMetrics: Send + Sync {
    /// Cached per-frame representation
    type Features;

    fn features(&self, frame: &Frame) -> Self::Features;

    /// Structural similarity, 0.0-1.0
    fn similarity(&self, a: &Self::Features, b: &Self::Features) -> f64;

    /// Text-readability quality, 0.0-1.0
    fn text_quality(&self, frame: &Frame, features: &Self::Features) -> f64;
}

/// SSIM on a downsampled gray copy; quality = 0.7 text likeliness + 0.3 sharpness
#[derive(Debug, Clone)]
pub struct HeuristicMetrics {
    pub downsample_width: u32,
}

impl Default for HeuristicMetrics {
    fn default() -> Self {
        Self {
            downsample_width: 256,
        }
    }
}

impl FrameMetrics for HeuristicMetrics {
    type Features = GrayBuffer;

    fn features(&self, frame: &Frame) -> GrayBuffer {
        GrayBuffer::from_rgba(&frame.image, self.downsample_width)
    }

    fn similarity(&self, a: &GrayBuffer, b: &GrayBuffer) -> f64 {
        ssim(a, b)
    }

    fn text_quality(&self, _frame: &Frame, features: &GrayBuffer) -> f64 {
        0.7 * features.text_likeliness() + 0.3 * features.sharpness()
    }
}

/// What happened to one input frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DedupDecision {
    /// Started a new cluster
    Kept { frame: usize, similarity: Option<f64> },
    /// Near-duplicate without enough quality gain
    Skipped {
        frame: usize,
        representative: usize,
        similarity: f64,
        quality_gain: f64,
    },
    /// Near-duplicate that replaced the representative
    Replaced {
        frame: usize,
        replaced: usize,
        similarity: f64,
        quality_gain: f64,
    },
}

/// Reduced frame list plus per-frame decisions
#[derive(Debug)]
pub struct DedupOutcome {
    pub frames: Vec<Frame>,
    pub decisions: Vec<DedupDecision>,
    pub original_count: usize,
}

struct Representative<F> {
    frame: Frame,
    features: F,
    quality: f64,
}

/// Cluster-representative frame selection
#[derive(Debug, Clone)]
pub struct FrameDeduplicator<M = HeuristicMetrics> {
    metrics: M,
    duplicate_threshold: f64,
    replacement_margin: f64,
}

impl FrameDeduplicator<HeuristicMetrics> {
    pub fn heuristic(duplicate_threshold: f64, replacement_margin: f64, downsample_width: u32) -> Self {
        Self::new(
            HeuristicMetrics { downsample_width },
            duplicate_threshold,
            replacement_margin,
        )
    }
}

impl<M: FrameMetrics> FrameDeduplicator<M> {
    pub fn new(metrics: M, duplicate_threshold: f64, replacement_margin: f64) -> Self {
        Self {
            metrics,
            duplicate_threshold,
            replacement_margin,
        }
    }

    /// Reduce `frames` to cluster representatives
    pub fn reduce(&self, frames: Vec<Frame>) -> DedupOutcome {
        let original_count = frames.len();
        if original_count <= 1 {
            return DedupOutcome {
                frames,
                decisions: Vec::new(),
                original_count,
            };
        }

        let mut clusters: Vec<Representative<M::Features>> = Vec::new();
        let mut decisions = Vec::with_capacity(original_count);

        for frame in frames {
            let features = self.metrics.features(&frame);
            let quality = self.metrics.text_quality(&frame, &features);

            let Some(current) = clusters.last_mut() else {
                trace!(frame = frame.index, quality, "First frame starts cluster");
                decisions.push(DedupDecision::Kept {
                    frame: frame.index,
                    similarity: None,
                });
                clusters.push(Representative { frame, features, quality });
                continue;
            };

            let similarity = self.metrics.similarity(&current.features, &features);
            if similarity < self.duplicate_threshold {
                decisions.push(DedupDecision::Kept {
                    frame: frame.index,
                    similarity: Some(similarity),
                });
                clusters.push(Representative { frame, features, quality });
                continue;
            }

            let quality_gain = quality - current.quality;
            if quality_gain > self.replacement_margin {
                decisions.push(DedupDecision::Replaced {
                    frame: frame.index,
                    replaced: current.frame.index,
                    similarity,
                    quality_gain,
                });
                // Superseded pixels are released here, not when the outcome is dropped
                let superseded = std::mem::replace(current, Representative { frame, features, quality });
                drop(superseded);
            } else {
                decisions.push(DedupDecision::Skipped {
                    frame: frame.index,
                    representative: current.frame.index,
                    similarity,
                    quality_gain,
                });
                drop(frame);
            }
        }

        let frames: Vec<Frame> = clusters.into_iter().map(|r| r.frame).collect();
        debug!(
            original = original_count,
            retained = frames.len(),
            "Frame deduplication complete"
        );
        DedupOutcome {
            frames,
            decisions,
            original_count,
        }
    }
}
