//! Analysis event types and EventBus
//!
//! Events are broadcast while an image is analysed so front-ends can show
//! progress. Nothing in the pipeline depends on anyone listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Analysis progress events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnalysisEvent {
    /// Analysis of one image started
    AnalysisStarted {
        analysis_id: Uuid,
        /// SHA-256 of the raw input bytes (hex)
        content_hash: String,
        timestamp: DateTime<Utc>,
    },

    /// Ledger restored from the result cache; no waves run
    CacheHit {
        analysis_id: Uuid,
        content_hash: String,
    },

    /// Animated input was reduced by frame deduplication
    FramesReduced {
        analysis_id: Uuid,
        original: usize,
        retained: usize,
    },

    /// A priority band is about to execute
    BandStarted {
        analysis_id: Uuid,
        priority: i32,
        waves: Vec<String>,
    },

    /// Wave finished and its signals are visible in the ledger
    WaveCompleted {
        analysis_id: Uuid,
        wave: String,
        signals: usize,
        duration_ms: u64,
    },

    /// Wave errored, timed out or panicked
    WaveFailed {
        analysis_id: Uuid,
        wave: String,
        error: String,
    },

    /// Wave predicate declined to run
    WaveSkipped {
        analysis_id: Uuid,
        wave: String,
    },

    /// Analysis finished
    AnalysisCompleted {
        analysis_id: Uuid,
        signals: usize,
        duration_ms: u64,
    },

    /// Analysis was cancelled before completion
    AnalysisCancelled { analysis_id: Uuid },
}

impl AnalysisEvent {
    /// Analysis this event belongs to
    pub fn analysis_id(&self) -> Uuid {
        match self {
            Self::AnalysisStarted { analysis_id, .. }
            | Self::CacheHit { analysis_id, .. }
            | Self::FramesReduced { analysis_id, .. }
            | Self::BandStarted { analysis_id, .. }
            | Self::WaveCompleted { analysis_id, .. }
            | Self::WaveFailed { analysis_id, .. }
            | Self::WaveSkipped { analysis_id, .. }
            | Self::AnalysisCompleted { analysis_id, .. }
            | Self::AnalysisCancelled { analysis_id } => *analysis_id,
        }
    }
}

/// Broadcast bus for analysis events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AnalysisEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<AnalysisEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: AnalysisEvent,
    ) -> Result<usize, broadcast::error::SendError<AnalysisEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: AnalysisEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
