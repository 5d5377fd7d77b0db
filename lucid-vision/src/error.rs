//! Error types for lucid-vision
//!
//! Only critical failures leave the orchestrator as an [`AnalysisError`].
//! Everything else is converted into a confidence-0 signal in the ledger.

use thiserror::Error;

/// Analysis-level failure
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Non-critical wave failure (normally recorded as `wave.error`)
    #[error("Wave '{wave}' failed: {message}")]
    WaveFailed { wave: String, message: String },

    /// Input bytes are not a decodable image
    #[error("Image decode failed: {0}")]
    CriticalDecodeFailure(String),

    /// A wave marked critical failed
    #[error("Critical wave '{wave}' failed: {message}")]
    CriticalWaveFailed { wave: String, message: String },

    /// Caller cancelled the analysis
    #[error("Analysis cancelled")]
    Cancelled,

    /// IO error reading input
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single wave
#[derive(Debug, Error)]
pub enum WaveError {
    #[error("{0}")]
    Failed(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Cancelled")]
    Cancelled,

    #[error("Panicked: {0}")]
    Panicked(String),
}

impl WaveError {
    /// Short machine-readable kind recorded as `error_kind` metadata
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Engine(EngineError::Unavailable(_)) => "engine_unavailable",
            Self::Engine(_) => "engine",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panic",
        }
    }
}

/// External engine failure (OCR or vision model)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Model call failed: {0}")]
    ModelCallFailed(String),

    #[error("Engine call timed out after {0} ms")]
    Timeout(u64),

    #[error("Engine call cancelled")]
    Cancelled,
}

/// Result cache failure
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AnalysisResult<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_converts_into_wave_error() {
        fn call() -> Result<(), WaveError> {
            Err(EngineError::ModelCallFailed("HTTP 500".into()))?;
            Ok(())
        }
        let err = call().unwrap_err();
        assert_eq!(err.kind(), "engine");
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[test]
    fn test_wave_error_kind() {
        assert_eq!(WaveError::Timeout(10).kind(), "timeout");
        assert_eq!(WaveError::Panicked("x".into()).kind(), "panic");
        assert_eq!(
            WaveError::Engine(EngineError::Unavailable("ocr".into())).kind(),
            "engine_unavailable"
        );
    }
}
