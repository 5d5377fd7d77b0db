//! lucid-vision library interface
//!
//! Signal-based image analysis: waves of analyzers write typed,
//! confidence-scored signals into a shared ledger, later waves read what
//! earlier ones found, and the finished ledger is cached by content hash.

pub mod aggregation;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod engines;
pub mod error;
pub mod escalation;
pub mod frames;
pub mod heuristics;
pub mod ledger;
pub mod orchestrator;
pub mod types;
pub mod wave;
pub mod waves;

pub use crate::aggregation::{AggregationConfig, AggregationStrategy, ConflictPolicy};
pub use crate::cache::{FileCacheStore, MemoryCacheStore, ResultCache};
pub use crate::config::{AnalysisConfig, LucidToml};
pub use crate::error::{AnalysisError, AnalysisResult, EngineError, WaveError};
pub use crate::frames::{AnalysisImage, Frame};
pub use crate::ledger::{LedgerSnapshot, SignalLedger};
pub use crate::orchestrator::{Analysis, Orchestrator};
pub use crate::types::{Signal, SignalValue};
pub use crate::wave::{Wave, WaveContext};
