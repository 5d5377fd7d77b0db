//! Core signal types
//!
//! A [`Signal`] is one typed, confidence-scored fact produced by a wave.
//! Signals are immutable once recorded in a ledger; a correction is a new
//! signal under the same key with higher-tier provenance, never an edit.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Confidence score (0.0-1.0)
pub type Confidence = f64;

/// Well-known signal keys
pub mod keys {
    pub const WAVE_ERROR: &str = "wave.error";
    pub const CONFLICT_UNRESOLVED: &str = "conflict.unresolved";

    pub const IDENTITY_WIDTH: &str = "identity.width";
    pub const IDENTITY_HEIGHT: &str = "identity.height";
    pub const IDENTITY_ASPECT_RATIO: &str = "identity.aspect_ratio";
    pub const IDENTITY_FRAME_COUNT: &str = "identity.frame_count";
    pub const IDENTITY_FORMAT: &str = "identity.format";
    pub const IDENTITY_ANIMATED: &str = "identity.animated";
    pub const IDENTITY_BYTE_LEN: &str = "identity.byte_len";

    pub const FRAMES_ORIGINAL: &str = "frames.original_count";
    pub const FRAMES_RETAINED: &str = "frames.retained_count";
    pub const FRAMES_DECISIONS: &str = "frames.dedup_decisions";

    pub const COLOR_MEAN_LUMA: &str = "color.mean_luma";
    pub const COLOR_FLAT_RATIO: &str = "color.flat_ratio";
    pub const COLOR_DOMINANT: &str = "color.dominant";
    pub const COLOR_IS_GRAYSCALE: &str = "color.is_grayscale";

    pub const QUALITY_SHARPNESS: &str = "quality.sharpness";
    pub const QUALITY_EDGE_DENSITY: &str = "quality.edge_density";
    pub const QUALITY_LOCAL_VARIANCE: &str = "quality.local_variance";

    pub const CONTENT_TEXT_LIKELIHOOD: &str = "content.text_likelihood";
    pub const CONTENT_SCREENSHOT_PROFILE: &str = "content.screenshot_profile";

    pub const TEXT_EXTRACTED: &str = "text.extracted";
    pub const TEXT_TIER: &str = "text.tier";
    pub const TEXT_VALIDATION_SCORE: &str = "text.validation_score";
    pub const TEXT_DEGRADED: &str = "text.degraded";
    pub const TEXT_ESCALATION: &str = "text.escalation";
    pub const OCR_REGIONS: &str = "ocr.regions";
    pub const OCR_UNAVAILABLE: &str = "ocr.unavailable";

    pub const VISION_CAPTION: &str = "vision.caption";
    pub const VISION_EMBEDDING: &str = "vision.embedding";
}

/// Well-known category tags
pub mod tags {
    pub const IDENTITY: &str = "identity";
    pub const FRAMES: &str = "frames";
    pub const COLOR: &str = "color";
    pub const QUALITY: &str = "quality";
    pub const CONTENT: &str = "content";
    pub const OCR: &str = "ocr";
    pub const TEXT: &str = "text";
    pub const VISION: &str = "vision";
    pub const ERROR: &str = "error";
    pub const CONFLICT: &str = "conflict";
    pub const DEGRADED: &str = "degraded";
}

/// Reference to binary content held outside the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryRef {
    pub uri: String,
    pub media_type: String,
    pub byte_len: u64,
}

/// Signal payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SignalValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Record(serde_json::Value),
    BinaryRef(BinaryRef),
}

impl SignalValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Record(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number(_))
    }

    /// Plain JSON rendering (no type tag), used when collecting values
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::json!(n),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Record(v) => v.clone(),
            Self::BinaryRef(r) => serde_json::json!({
                "uri": r.uri,
                "media_type": r.media_type,
                "byte_len": r.byte_len,
            }),
        }
    }

    /// Short human-readable rendering for logs and conflict reports
    pub fn display_value(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format!("{n}"),
            Self::Text(s) => s.clone(),
            Self::Record(v) => v.to_string(),
            Self::BinaryRef(r) => r.uri.clone(),
        }
    }
}

impl From<bool> for SignalValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for SignalValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for SignalValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SignalValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Auxiliary metadata value (non-authoritative)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u8> for MetaValue {
    fn from(value: u8) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<usize> for MetaValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One typed, confidence-scored fact about an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Dotted namespace key (e.g. "text.extracted")
    pub key: String,
    /// Payload
    pub value: SignalValue,
    /// Confidence score (0.0-1.0)
    pub confidence: Confidence,
    /// Producing wave
    pub source: String,
    /// Category labels for bulk retrieval
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Free-form auxiliary data
    #[serde(default)]
    pub metadata: BTreeMap<String, MetaValue>,
}

impl Signal {
    /// Create new signal with clamped confidence (0.0-1.0)
    pub fn new(
        key: impl Into<String>,
        value: impl Into<SignalValue>,
        confidence: Confidence,
        source: impl Into<String>,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            key: key.into(),
            value: value.into(),
            confidence,
            source: source.into(),
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Confidence-0 failure signal
    pub fn failure(
        key: impl Into<String>,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(key, SignalValue::Text(message.into()), 0.0, source).with_tag(tags::ERROR)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn meta(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_clamping() {
        let s = Signal::new("quality.sharpness", 0.4, 1.5, "quality");
        assert_eq!(s.confidence, 1.0, "Confidence should be clamped to 1.0");

        let s2 = Signal::new("quality.sharpness", 0.4, -0.5, "quality");
        assert_eq!(s2.confidence, 0.0, "Confidence should be clamped to 0.0");

        let s3 = Signal::new("quality.sharpness", 0.4, f64::NAN, "quality");
        assert_eq!(s3.confidence, 0.0);
    }

    #[test]
    fn test_failure_signal_shape() {
        let s = Signal::failure(keys::WAVE_ERROR, "color", "boom");
        assert_eq!(s.confidence, 0.0);
        assert!(s.has_tag(tags::ERROR));
        assert_eq!(s.value.as_text(), Some("boom"));
    }

    #[test]
    fn test_serde_preserves_every_field() {
        let signal = Signal::new(
            keys::TEXT_EXTRACTED,
            "Back of the net",
            0.82,
            "text",
        )
        .with_tags([tags::OCR, tags::TEXT])
        .with_meta("tier", 3i64)
        .with_meta("validation_score", 12.5)
        .with_meta("degraded", false)
        .with_meta("engine", "mock");

        let json = serde_json::to_string(&signal).unwrap();
        let back: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signal);
        assert_eq!(back.meta("tier").and_then(MetaValue::as_i64), Some(3));
    }

    #[test]
    fn test_binary_ref_and_record_round_trip() {
        let signal = Signal::new(
            "vision.thumbnail",
            SignalValue::BinaryRef(BinaryRef {
                uri: "cache://thumb/abc".to_string(),
                media_type: "image/png".to_string(),
                byte_len: 2048,
            }),
            1.0,
            "identity",
        );
        let back: Signal = serde_json::from_str(&serde_json::to_string(&signal).unwrap()).unwrap();
        assert_eq!(back, signal);

        let record = Signal::new(
            keys::OCR_REGIONS,
            SignalValue::Record(serde_json::json!([{"text": "hi", "confidence": 0.9}])),
            0.9,
            "text",
        );
        let back: Signal = serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_meta_float_with_integral_value_stays_float() {
        let signal = Signal::new("k", 1.0, 1.0, "w").with_meta("ratio", 2.0);
        let back: Signal = serde_json::from_str(&serde_json::to_string(&signal).unwrap()).unwrap();
        assert_eq!(back.meta("ratio"), Some(&MetaValue::Float(2.0)));
    }
}
