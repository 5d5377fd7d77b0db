//! Analysis configuration
//!
//! Every threshold the pipeline uses lives here and is passed explicitly into
//! [`crate::orchestrator::Orchestrator`] construction. There is no ambient or
//! global configuration state.

use crate::aggregation::{AggregationConfig, AggregationStrategy, ConflictPolicy};
use lucid_common::config::{ConfigSource, LoggingConfig};
use lucid_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level TOML file layout (`lucid.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LucidToml {
    pub logging: LoggingConfig,
    pub analysis: AnalysisConfig,
    pub engines: EngineConfig,
    pub cache: CacheConfig,
}

impl LucidToml {
    /// Resolve (CLI → ENV → platform dir → defaults), load and validate
    pub fn load(cli_arg: Option<&Path>) -> Result<(Self, ConfigSource)> {
        let (config, source): (Self, ConfigSource) = lucid_common::config::load_config(cli_arg)?;
        config.analysis.validate()?;
        Ok((config, source))
    }
}

/// External engine endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path or name of the tesseract executable; `None` disables Tier 1
    pub tesseract_command: Option<String>,
    /// OCR language passed to tesseract
    pub tesseract_language: String,
    /// Ollama base URL; `None` disables vision calls
    pub ollama_url: Option<String>,
    pub vision_model: String,
    pub embedding_model: String,
    /// Maximum vision requests per second
    pub vision_requests_per_second: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tesseract_command: Some("tesseract".to_string()),
            tesseract_language: "eng".to_string(),
            ollama_url: None,
            vision_model: "llava".to_string(),
            embedding_model: "nomic-embed-vision".to_string(),
            vision_requests_per_second: 2,
        }
    }
}

/// Result cache location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory for the file-backed cache; `None` keeps results in memory only
    pub directory: Option<PathBuf>,
}

/// Thresholds and budgets for one analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// SSIM at or above which a frame is a near-duplicate of its representative
    pub duplicate_threshold: f64,
    /// Text-quality improvement required to replace a representative frame
    pub replacement_margin: f64,
    /// Width of the grayscale buffer used by fast heuristics
    pub downsample_width: u32,
    /// Run frame deduplication on animated inputs
    pub dedup_enabled: bool,

    /// Tier-2 acceptance ceiling (mean bigram perplexity)
    pub perplexity_ceiling: f64,
    /// Contribution of an unseen word pair
    pub neutral_perplexity: f64,
    /// Pairs with probability below this are known-bad
    pub known_bad_floor: f64,
    /// Contribution of a known-bad pair
    pub bad_pair_penalty: f64,
    /// Tier-1 text with mean region confidence below this is malformed
    pub min_ocr_confidence: f64,
    /// Tier-1 text with more non-alphanumeric symbols than this is malformed
    pub max_symbol_ratio: f64,
    /// Allow Tier-3 model-assisted correction
    pub tier3_enabled: bool,
    /// Tier-3 network budget (milliseconds)
    pub tier3_timeout_ms: u64,

    /// Per-wave execution budget (milliseconds)
    pub wave_timeout_ms: u64,
    /// Upper bound on concurrently running waves within a band
    pub max_concurrent_waves: usize,

    /// Text extraction stops at Tier 1 below this `content.text_likelihood` …
    pub text_likelihood_threshold: f64,
    /// … unless the screenshot profile matches
    pub screenshot: ScreenshotProfile,

    /// Request captions (and optionally embeddings) from the vision model
    pub caption_enabled: bool,
    pub embedding_enabled: bool,

    /// Per-key aggregation strategy and global conflict policy
    pub aggregation: AggregationConfig,

    /// Result cache format version; bumping it invalidates older entries
    pub cache_format_version: u32,
}

/// Thresholds describing a software screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotProfile {
    pub min_flat_ratio: f64,
    pub min_edge_density: f64,
    pub min_aspect_ratio: f64,
}

impl Default for ScreenshotProfile {
    fn default() -> Self {
        Self {
            min_flat_ratio: 0.45,
            min_edge_density: 0.06,
            min_aspect_ratio: 1.3,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let mut aggregation = AggregationConfig::default();
        aggregation.set_strategy("quality.*", AggregationStrategy::WeightedAverage);
        aggregation.set_strategy("text.extracted", AggregationStrategy::MostRecent);
        aggregation.set_strategy(crate::types::keys::WAVE_ERROR, AggregationStrategy::Collect);
        aggregation.set_strategy(
            crate::types::keys::CONFLICT_UNRESOLVED,
            AggregationStrategy::Collect,
        );
        aggregation.conflict_policy = ConflictPolicy::TrustHigherConfidence;

        Self {
            duplicate_threshold: 0.95,
            replacement_margin: 0.20,
            downsample_width: 256,
            dedup_enabled: true,
            perplexity_ceiling: 60.0,
            neutral_perplexity: 50.0,
            known_bad_floor: 0.001,
            bad_pair_penalty: 1000.0,
            min_ocr_confidence: 0.6,
            max_symbol_ratio: 0.3,
            tier3_enabled: true,
            tier3_timeout_ms: 60_000,
            wave_timeout_ms: 15_000,
            max_concurrent_waves: 4,
            text_likelihood_threshold: 0.3,
            screenshot: ScreenshotProfile::default(),
            caption_enabled: false,
            embedding_enabled: false,
            aggregation,
            cache_format_version: crate::cache::CACHE_FORMAT_VERSION,
        }
    }
}

impl AnalysisConfig {
    pub fn wave_timeout(&self) -> Duration {
        Duration::from_millis(self.wave_timeout_ms)
    }

    pub fn tier3_timeout(&self) -> Duration {
        Duration::from_millis(self.tier3_timeout_ms)
    }

    /// Reject out-of-range thresholds
    pub fn validate(&self) -> Result<()> {
        fn unit(name: &str, value: f64) -> Result<()> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(Error::invalid(
                    name,
                    format!("must be within 0.0-1.0 (got {})", value),
                ))
            }
        }

        unit("duplicate_threshold", self.duplicate_threshold)?;
        unit("replacement_margin", self.replacement_margin)?;
        unit("known_bad_floor", self.known_bad_floor)?;
        unit("min_ocr_confidence", self.min_ocr_confidence)?;
        unit("max_symbol_ratio", self.max_symbol_ratio)?;
        unit("text_likelihood_threshold", self.text_likelihood_threshold)?;
        unit("aggregation.conflict_margin", self.aggregation.conflict_margin)?;

        if self.downsample_width < 8 {
            return Err(Error::invalid(
                "downsample_width",
                format!("must be at least 8 (got {})", self.downsample_width),
            ));
        }
        if self.perplexity_ceiling <= 0.0 || self.neutral_perplexity <= 0.0 {
            return Err(Error::invalid(
                "perplexity_ceiling",
                "perplexity_ceiling and neutral_perplexity must be positive",
            ));
        }
        if self.max_concurrent_waves == 0 {
            return Err(Error::invalid("max_concurrent_waves", "must be at least 1"));
        }
        if self.wave_timeout_ms == 0 || self.tier3_timeout_ms == 0 {
            return Err(Error::invalid("wave_timeout_ms", "timeouts must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AnalysisConfig::default();
        assert_eq!(config.duplicate_threshold, 0.95);
        assert_eq!(config.replacement_margin, 0.20);
        assert_eq!(config.downsample_width, 256);
        assert_eq!(config.perplexity_ceiling, 60.0);
        assert!(config.tier3_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = AnalysisConfig {
            duplicate_threshold: 1.5,
            ..AnalysisConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidSetting { ref key, .. }) if key == "duplicate_threshold"
        ));

        let config = AnalysisConfig {
            max_concurrent_waves: 0,
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml_str = r#"
            [analysis]
            duplicate_threshold = 0.9
            tier3_enabled = false

            [analysis.aggregation]
            conflict_policy = "trust_newer"

            [analysis.aggregation.strategies]
            "color.*" = "majority_vote"
        "#;
        let parsed: LucidToml = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.analysis.duplicate_threshold, 0.9);
        assert!(!parsed.analysis.tier3_enabled);
        assert_eq!(parsed.analysis.replacement_margin, 0.20);
        assert_eq!(parsed.analysis.aggregation.conflict_policy, ConflictPolicy::TrustNewer);
        assert_eq!(
            parsed.analysis.aggregation.strategy_for("color.dominant"),
            AggregationStrategy::MajorityVote
        );
        assert_eq!(parsed.logging.level, "info");
    }
}
