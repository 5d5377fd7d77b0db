//! Tiered text extraction
//!
//! Tier 1 reads text with a local OCR engine. Tier 2 scores it with a bigram
//! model and may propose word substitutions. Tier 3 asks a vision-language
//! model to correct the reading, and is the only tier with network cost, so it
//! runs only when:
//!
//! - Tier 1 flagged the text as malformed, or
//! - Tier 2 proposed a correction, or
//! - Tier 2 was inconclusive while Tier 1 flagged the text
//!
//! Tier 3 sees each frame that contributed text together with the lines read
//! from that frame. A Tier-3 answer supersedes the lower tiers. A Tier-3
//! failure falls back to the best lower-tier text and marks the result
//! degraded.
//!
//! When text is unlikely the cascade is capped at Tier 1 and the cap is
//! recorded with the result.

pub mod bigram;
pub mod tier1;

use crate::cache::ResultCache;
use crate::config::AnalysisConfig;
use crate::engines::{CallOptions, OcrEngine, VisionModel};
use crate::error::EngineError;
use crate::frames::Frame;
use crate::types::{keys, tags, Signal, SignalValue};
use bigram::{BigramModel, BigramSettings, Tier2Outcome, Tier2Result};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tier1::Tier1Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why Tier 3 was invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier3Reason {
    Malformed,
    CorrectionProposed,
    InconclusiveWhileMalformed,
}

/// Tier-3 eligibility from the lower-tier results
pub fn tier3_reason(tier1: &Tier1Result, tier2: &Tier2Result) -> Option<Tier3Reason> {
    if tier1.malformed && tier2.outcome == Tier2Outcome::Inconclusive {
        Some(Tier3Reason::InconclusiveWhileMalformed)
    } else if tier1.malformed {
        Some(Tier3Reason::Malformed)
    } else if tier2.correction_proposed() {
        Some(Tier3Reason::CorrectionProposed)
    } else {
        None
    }
}

/// What happened at Tier 3
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Tier3Status {
    /// Lower tiers were sufficient, or the cascade was capped
    NotNeeded,
    /// Eligible but disabled or no model configured
    Skipped { reason: Tier3Reason, why: String },
    Succeeded { reason: Tier3Reason, cached: bool },
    Failed { reason: Tier3Reason, error: String },
}

impl Tier3Status {
    /// Whether the vision model was asked (or its cached answer used)
    pub fn attempted(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

/// Why the cascade stopped after Tier 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationCap {
    /// Text likelihood below threshold and no screenshot profile
    LowTextLikelihood,
}

impl EscalationCap {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowTextLikelihood => "low_text_likelihood",
        }
    }

    /// `text.escalation` record for a capped run that read no text
    pub fn to_signal(self, source: &str) -> Signal {
        Signal::new(
            keys::TEXT_ESCALATION,
            SignalValue::Record(serde_json::json!({
                "tier": 1,
                "cap": self,
                "text_found": false,
            })),
            1.0,
            source,
        )
        .with_tag(tags::TEXT)
        .with_meta("cap", self.as_str())
    }
}

/// Final text and the trail of tier decisions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationResult {
    pub text: String,
    /// Highest tier actually executed (1, 2 or 3)
    pub tier: u8,
    /// Tier whose answer became `text`
    pub text_tier: u8,
    pub confidence: f64,
    pub degraded: bool,
    pub correction_applied: bool,
    pub tier1: Tier1Result,
    /// Absent when the cascade was capped at Tier 1
    pub tier2: Option<Tier2Result>,
    pub tier3: Tier3Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<EscalationCap>,
}

impl EscalationResult {
    /// Ledger signals for this result, attributed to `source`
    pub fn to_signals(&self, source: &str) -> Vec<Signal> {
        let mut signals = Vec::with_capacity(6);

        let mut extracted =
            Signal::new(keys::TEXT_EXTRACTED, self.text.clone(), self.confidence, source)
                .with_tags([tags::TEXT, tags::OCR])
                .with_meta("tier", i64::from(self.tier))
                .with_meta("text_tier", i64::from(self.text_tier))
                .with_meta("degraded", self.degraded)
                .with_meta("correction_applied", self.correction_applied);
        if let Some(tier2) = &self.tier2 {
            extracted = extracted.with_meta("validation_score", tier2.score);
        }
        signals.push(extracted);
        signals.push(
            Signal::new(keys::TEXT_TIER, f64::from(self.tier), 1.0, source).with_tag(tags::TEXT),
        );
        if let Some(tier2) = &self.tier2 {
            signals.push(
                Signal::new(keys::TEXT_VALIDATION_SCORE, tier2.score, 1.0, source)
                    .with_tag(tags::TEXT)
                    .with_meta("outcome", format!("{:?}", tier2.outcome).to_lowercase()),
            );
        }
        signals.push(
            Signal::new(
                keys::OCR_REGIONS,
                SignalValue::Record(serde_json::to_value(&self.tier1.regions).unwrap_or_default()),
                self.tier1.mean_confidence,
                source,
            )
            .with_tag(tags::OCR)
            .with_meta("count", self.tier1.regions.len()),
        );
        let mut escalation = Signal::new(
            keys::TEXT_ESCALATION,
            SignalValue::Record(serde_json::to_value(self).unwrap_or_default()),
            1.0,
            source,
        )
        .with_tag(tags::TEXT);
        if let Some(cap) = self.cap {
            escalation = escalation.with_meta("cap", cap.as_str());
        }
        signals.push(escalation);
        if self.degraded {
            let error = match &self.tier3 {
                Tier3Status::Failed { error, .. } => error.clone(),
                _ => "tier 3 unavailable".to_string(),
            };
            signals.push(
                Signal::new(keys::TEXT_DEGRADED, true, 1.0, source)
                    .with_tags([tags::TEXT, tags::DEGRADED])
                    .with_meta("error", error),
            );
        }
        signals
    }
}

/// Runs the three-tier cascade for one image
#[derive(Clone)]
pub struct TextEscalator {
    ocr: Arc<dyn OcrEngine>,
    vision: Option<Arc<dyn VisionModel>>,
    model: Arc<BigramModel>,
    cache: Option<ResultCache>,
    config: Arc<AnalysisConfig>,
}

impl std::fmt::Debug for TextEscalator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextEscalator")
            .field("ocr", &self.ocr.name())
            .field("vision", &self.vision.as_ref().map(|v| v.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl TextEscalator {
    pub fn new(ocr: Arc<dyn OcrEngine>, config: Arc<AnalysisConfig>) -> Self {
        Self {
            ocr,
            vision: None,
            model: Arc::new(BigramModel::builtin()),
            cache: None,
            config,
        }
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionModel>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_model(mut self, model: Arc<BigramModel>) -> Self {
        self.model = model;
        self
    }

    /// Memoize Tier-3 answers in `cache`
    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    async fn read(&self, frames: &[Frame]) -> Result<Tier1Result, EngineError> {
        tier1::run(
            self.ocr.as_ref(),
            frames,
            self.config.min_ocr_confidence,
            self.config.max_symbol_ratio,
        )
        .await
    }

    /// Tier 1 only; the result records `cap` as the reason
    pub async fn escalate_capped(
        &self,
        frames: &[Frame],
        cap: EscalationCap,
    ) -> Result<Option<EscalationResult>, EngineError> {
        let tier1 = self.read(frames).await?;
        if tier1.is_empty() {
            debug!(cap = cap.as_str(), "Tier 1 found no text");
            return Ok(None);
        }
        debug!(cap = cap.as_str(), "Cascade capped at Tier 1");
        Ok(Some(EscalationResult {
            text: tier1.text.clone(),
            tier: 1,
            text_tier: 1,
            confidence: tier1.mean_confidence,
            degraded: false,
            correction_applied: false,
            tier1,
            tier2: None,
            tier3: Tier3Status::NotNeeded,
            cap: Some(cap),
        }))
    }

    /// Run the cascade over representative frames
    ///
    /// Returns `Ok(None)` when Tier 1 finds no text. Only Tier-1 engine
    /// failures are returned as errors.
    pub async fn escalate(
        &self,
        frames: &[Frame],
        content_hash: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<EscalationResult>, EngineError> {
        let config = &self.config;
        let tier1 = self.read(frames).await?;
        if tier1.is_empty() {
            debug!("Tier 1 found no text");
            return Ok(None);
        }

        let settings = BigramSettings::from(config.as_ref());
        let tier2 = self.model.evaluate(&tier1.text, &settings);
        debug!(
            outcome = ?tier2.outcome,
            score = tier2.score,
            corrections = tier2.corrections.len(),
            malformed = tier1.malformed,
            "Tier 2 evaluated"
        );

        // Best lower-tier answer
        let (prior_text, prior_tier, prior_confidence) = match &tier2.corrected_text {
            Some(corrected) => (corrected.clone(), 2u8, tier1.mean_confidence),
            None if tier2.outcome == Tier2Outcome::Validated => (
                tier1.text.clone(),
                2u8,
                (tier1.mean_confidence + 1.0) / 2.0,
            ),
            None => (tier1.text.clone(), 1u8, tier1.mean_confidence),
        };
        let correction_applied = tier2.corrected_text.is_some();
        let lower = |tier3: Tier3Status,
                     confidence: f64,
                     degraded: bool,
                     tier1: Tier1Result,
                     tier2: Tier2Result| {
            EscalationResult {
                text: prior_text.clone(),
                tier: if tier3.attempted() { 3 } else { 2 },
                text_tier: prior_tier,
                confidence,
                degraded,
                correction_applied,
                tier1,
                tier2: Some(tier2),
                tier3,
                cap: None,
            }
        };

        let Some(reason) = tier3_reason(&tier1, &tier2) else {
            return Ok(Some(lower(
                Tier3Status::NotNeeded,
                prior_confidence,
                false,
                tier1,
                tier2,
            )));
        };

        let vision = match (&self.vision, config.tier3_enabled) {
            (Some(vision), true) => Arc::clone(vision),
            (vision, enabled) => {
                let why = if !enabled {
                    "tier 3 disabled"
                } else if vision.is_none() {
                    "no vision model configured"
                } else {
                    "unavailable"
                };
                debug!(reason = ?reason, why, "Tier 3 eligible but skipped");
                let skipped = Tier3Status::Skipped {
                    reason,
                    why: why.to_string(),
                };
                return Ok(Some(lower(skipped, prior_confidence, false, tier1, tier2)));
            }
        };

        let candidate = tier2
            .corrected_text
            .clone()
            .unwrap_or_else(|| tier1.text.clone());
        let groups = tier1.lines_by_frame(&candidate).unwrap_or_else(|| {
            let first = tier1.regions.first().map_or(0, |r| r.frame);
            vec![(first, candidate.clone())]
        });
        info!(reason = ?reason, frames = groups.len(), "Escalating to Tier 3");

        let answers = try_join_all(groups.iter().map(|(index, lines)| {
            let vision = vision.as_ref();
            async move {
                let frame = frames.iter().find(|f| f.index == *index).ok_or_else(|| {
                    EngineError::ModelCallFailed(format!("frame {} is not available", index))
                })?;
                self.correct_on_frame(vision, frame, lines, content_hash, cancel)
                    .await
            }
        }))
        .await;

        match answers {
            Ok(answers) => {
                let cached = answers.iter().all(|(_, cached)| *cached);
                let text = answers
                    .into_iter()
                    .map(|(text, _)| text)
                    .collect::<Vec<_>>()
                    .join("\n");
                let correction_applied = text != tier1.text;
                Ok(Some(EscalationResult {
                    text,
                    tier: 3,
                    text_tier: 3,
                    confidence: 0.9,
                    degraded: false,
                    correction_applied,
                    tier1,
                    tier2: Some(tier2),
                    tier3: Tier3Status::Succeeded { reason, cached },
                    cap: None,
                }))
            }
            Err(e) => {
                let error = e.to_string();
                warn!(error = %error, "Tier 3 failed, falling back to lower tier");
                let failed = Tier3Status::Failed { reason, error };
                Ok(Some(lower(failed, prior_confidence * 0.5, true, tier1, tier2)))
            }
        }
    }

    /// Tier-3 reading of `candidate` against one frame, memoized per frame
    async fn correct_on_frame(
        &self,
        vision: &dyn VisionModel,
        frame: &Frame,
        candidate: &str,
        content_hash: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, bool), EngineError> {
        let operation = format!("correct_text/{}/frame-{}", vision.name(), frame.index);
        if let Some(cache) = &self.cache {
            if let Some(text) = cache
                .get_model_output(content_hash, &operation, candidate)
                .await
            {
                debug!(frame = frame.index, "Tier 3 answer served from cache");
                return Ok((text, true));
            }
        }

        let opts = CallOptions::new(self.config.tier3_timeout(), cancel.child_token());
        let text = vision
            .correct_text(&frame.image, candidate, &opts)
            .await?
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(EngineError::ModelCallFailed("empty model answer".to_string()));
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache
                .put_model_output(content_hash, &operation, candidate, &text)
                .await
            {
                warn!(error = %e, "Failed to memoize Tier 3 answer");
            }
        }
        Ok((text, false))
    }
}
