//! Wave orchestrator
//!
//! Runs one image through the registered waves:
//!
//! 1. Hash the raw bytes and consult the result cache. A hit returns the
//!    stored ledger without decoding or running any wave.
//! 2. Decode (failure is fatal) and deduplicate animation frames.
//! 3. Run waves in priority bands, highest first. Waves in one band run
//!    concurrently, bounded by `max_concurrent_waves`; the next band starts
//!    only after every wave of the current band has finished.
//! 4. Finalize the ledger, snapshot it, and store it in the cache.
//!
//! A wave that errors, times out or panics is recorded as one `wave.error`
//! signal and the analysis continues, unless the wave is critical.
//! Cancellation is checked before every band and raced inside every wave; a
//! cancelled analysis is never cached.

use crate::aggregation::AggregationConfig;
use crate::cache::{sha256_hex, ResultCache};
use crate::config::AnalysisConfig;
use crate::dedup::FrameDeduplicator;
use crate::error::{AnalysisError, AnalysisResult, WaveError};
use crate::frames::AnalysisImage;
use crate::ledger::{LedgerSnapshot, SignalLedger};
use crate::types::{keys, tags, Signal, SignalValue};
use crate::wave::{Wave, WaveContext};
use futures::FutureExt;
use lucid_common::events::{AnalysisEvent, EventBus};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Source name of signals recorded by frame deduplication
pub const DEDUP_SOURCE: &str = "frame_dedup";

/// Result of one analysis
#[derive(Debug, Clone)]
pub struct Analysis {
    pub id: Uuid,
    pub snapshot: LedgerSnapshot,
    /// Ledger came from the result cache; no wave ran
    pub cache_hit: bool,
    pub duration_ms: u64,
}

impl Analysis {
    /// Queryable ledger rebuilt from the snapshot
    pub fn ledger(&self, aggregation: Arc<AggregationConfig>) -> SignalLedger {
        SignalLedger::from_snapshot(&self.snapshot, aggregation)
    }
}

/// Outcome of one wave task
struct WaveRun {
    name: String,
    critical: bool,
    result: Result<Vec<Signal>, WaveError>,
    elapsed: Duration,
}

/// Drives waves over one image at a time
pub struct Orchestrator {
    config: Arc<AnalysisConfig>,
    waves: Vec<Arc<dyn Wave>>,
    cache: Option<ResultCache>,
    events: Option<EventBus>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("waves", &self.waves.iter().map(|w| w.name().to_string()).collect::<Vec<_>>())
            .field("cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<Arc<AnalysisConfig>>,
    waves: Vec<Arc<dyn Wave>>,
    cache: Option<ResultCache>,
    events: Option<EventBus>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: impl Into<Arc<AnalysisConfig>>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn wave(mut self, wave: Arc<dyn Wave>) -> Self {
        self.waves.push(wave);
        self
    }

    pub fn waves(mut self, waves: impl IntoIterator<Item = Arc<dyn Wave>>) -> Self {
        self.waves.extend(waves);
        self
    }

    pub fn cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate configuration and wave names
    pub fn build(self) -> lucid_common::Result<Orchestrator> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let mut names = HashSet::new();
        for wave in &self.waves {
            if !names.insert(wave.name().to_string()) {
                return Err(lucid_common::Error::invalid(
                    "waves",
                    format!("duplicate wave name '{}'", wave.name()),
                ));
            }
        }

        Ok(Orchestrator {
            config,
            waves: self.waves,
            cache: self.cache,
            events: self.events,
        })
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&ResultCache> {
        self.cache.as_ref()
    }

    fn emit(&self, event: AnalysisEvent) {
        if let Some(bus) = &self.events {
            bus.emit_lossy(event);
        }
    }

    /// Read and analyse a file
    pub async fn analyze_path(
        &self,
        path: impl AsRef<Path>,
        cancel: CancellationToken,
    ) -> AnalysisResult<Analysis> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Reading image");
        let bytes = tokio::fs::read(path).await?;
        self.analyze_bytes(bytes, cancel).await
    }

    /// Analyse encoded image bytes
    pub async fn analyze_bytes(
        &self,
        bytes: Vec<u8>,
        cancel: CancellationToken,
    ) -> AnalysisResult<Analysis> {
        let id = Uuid::new_v4();
        let started = Instant::now();

        let (bytes, content_hash) = tokio::task::spawn_blocking(move || {
            let hash = sha256_hex(&bytes);
            (bytes, hash)
        })
        .await
        .map_err(|e| AnalysisError::WaveFailed {
            wave: "hash".to_string(),
            message: e.to_string(),
        })?;

        info!(analysis_id = %id, content_hash = %content_hash, bytes = bytes.len(), "Analysis started");
        self.emit(AnalysisEvent::AnalysisStarted {
            analysis_id: id,
            content_hash: content_hash.clone(),
            timestamp: chrono::Utc::now(),
        });

        if cancel.is_cancelled() {
            self.emit(AnalysisEvent::AnalysisCancelled { analysis_id: id });
            return Err(AnalysisError::Cancelled);
        }

        if let Some(cache) = &self.cache {
            if let Some(snapshot) = cache.get_ledger(&content_hash).await {
                info!(analysis_id = %id, content_hash = %content_hash, "Result cache hit");
                self.emit(AnalysisEvent::CacheHit {
                    analysis_id: id,
                    content_hash: content_hash.clone(),
                });
                return Ok(Analysis {
                    id,
                    snapshot,
                    cache_hit: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        }

        let image = tokio::task::spawn_blocking(move || AnalysisImage::decode(&bytes))
            .await
            .map_err(|e| AnalysisError::CriticalDecodeFailure(format!("decode task failed: {}", e)))?
            .inspect_err(|e| error!(analysis_id = %id, error = %e, "Image decode failed"))?;

        let snapshot = self.execute(id, image, content_hash, &cancel).await?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put_ledger(&snapshot).await {
                warn!(analysis_id = %id, error = %e, "Failed to store ledger in result cache");
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.emit(AnalysisEvent::AnalysisCompleted {
            analysis_id: id,
            signals: snapshot.signals.len(),
            duration_ms,
        });
        Ok(Analysis {
            id,
            snapshot,
            cache_hit: false,
            duration_ms,
        })
    }

    /// Analyse an already-decoded image
    ///
    /// The content hash is taken over the RGBA pixels of every frame. The
    /// result cache is neither read nor written.
    pub async fn run(
        &self,
        image: AnalysisImage,
        cancel: CancellationToken,
    ) -> AnalysisResult<Analysis> {
        let id = Uuid::new_v4();
        let started = Instant::now();

        let (image, content_hash) = tokio::task::spawn_blocking(move || {
            let pixels: Vec<u8> = image
                .frames
                .iter()
                .flat_map(|f| f.image.as_raw().iter().copied())
                .collect();
            let hash = sha256_hex(&pixels);
            (image, hash)
        })
        .await
        .map_err(|e| AnalysisError::WaveFailed {
            wave: "hash".to_string(),
            message: e.to_string(),
        })?;

        self.emit(AnalysisEvent::AnalysisStarted {
            analysis_id: id,
            content_hash: content_hash.clone(),
            timestamp: chrono::Utc::now(),
        });
        let snapshot = self.execute(id, image, content_hash, &cancel).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.emit(AnalysisEvent::AnalysisCompleted {
            analysis_id: id,
            signals: snapshot.signals.len(),
            duration_ms,
        });
        Ok(Analysis {
            id,
            snapshot,
            cache_hit: false,
            duration_ms,
        })
    }

    fn cancelled(&self, id: Uuid) -> AnalysisError {
        info!(analysis_id = %id, "Analysis cancelled");
        self.emit(AnalysisEvent::AnalysisCancelled { analysis_id: id });
        AnalysisError::Cancelled
    }

    /// Dedup, bands, finalize
    async fn execute(
        &self,
        id: Uuid,
        mut image: AnalysisImage,
        content_hash: String,
        cancel: &CancellationToken,
    ) -> AnalysisResult<LedgerSnapshot> {
        let config = Arc::clone(&self.config);
        let ledger = Arc::new(SignalLedger::new(
            content_hash.clone(),
            Arc::new(config.aggregation.clone()),
        ));

        if image.is_animated() && config.dedup_enabled {
            image = self.deduplicate(id, image, &ledger).await?;
        }

        // Bands in descending priority, registration order within a band
        let mut bands: BTreeMap<Reverse<i32>, Vec<Arc<dyn Wave>>> = BTreeMap::new();
        for wave in &self.waves {
            bands
                .entry(Reverse(wave.priority()))
                .or_default()
                .push(Arc::clone(wave));
        }
        let bands: Vec<(i32, Vec<Arc<dyn Wave>>)> =
            bands.into_iter().map(|(Reverse(p), w)| (p, w)).collect();
        let last_pixel_band = bands
            .iter()
            .rposition(|(_, waves)| waves.iter().any(|w| w.needs_pixels()));

        let mut image = Some(Arc::new(image));
        if last_pixel_band.is_none() {
            image = None;
        }

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_waves));

        for (band_index, (priority, waves)) in bands.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(self.cancelled(id));
            }

            let mut runnable = Vec::with_capacity(waves.len());
            for wave in waves {
                if wave.should_run(&ledger, &config) {
                    runnable.push(wave);
                } else {
                    debug!(analysis_id = %id, wave = %wave.name(), "Wave skipped by predicate");
                    self.emit(AnalysisEvent::WaveSkipped {
                        analysis_id: id,
                        wave: wave.name().to_string(),
                    });
                }
            }

            if !runnable.is_empty() {
                debug!(analysis_id = %id, priority, waves = runnable.len(), "Band started");
                self.emit(AnalysisEvent::BandStarted {
                    analysis_id: id,
                    priority,
                    waves: runnable.iter().map(|w| w.name().to_string()).collect(),
                });

                let ctx = WaveContext::new(
                    image.clone(),
                    Arc::clone(&config),
                    content_hash.clone(),
                    cancel.clone(),
                );
                self.run_band(id, runnable, ctx, &ledger, &semaphore).await?;
            }

            if cancel.is_cancelled() {
                return Err(self.cancelled(id));
            }

            if last_pixel_band == Some(band_index) && image.take().is_some() {
                debug!(analysis_id = %id, "Decoded frames released");
            }
        }

        let conflicts = ledger.finalize();
        if !conflicts.is_empty() {
            debug!(analysis_id = %id, conflicts = conflicts.len(), "Ledger finalized with conflicts");
        }
        if cancel.is_cancelled() {
            return Err(self.cancelled(id));
        }
        Ok(ledger.snapshot())
    }

    async fn deduplicate(
        &self,
        id: Uuid,
        mut image: AnalysisImage,
        ledger: &SignalLedger,
    ) -> AnalysisResult<AnalysisImage> {
        let dedup = FrameDeduplicator::heuristic(
            self.config.duplicate_threshold,
            self.config.replacement_margin,
            self.config.downsample_width,
        );
        let frames = std::mem::take(&mut image.frames);
        let outcome = tokio::task::spawn_blocking(move || dedup.reduce(frames))
            .await
            .map_err(|e| AnalysisError::WaveFailed {
                wave: DEDUP_SOURCE.to_string(),
                message: e.to_string(),
            })?;

        info!(
            analysis_id = %id,
            original = outcome.original_count,
            retained = outcome.frames.len(),
            "Animation frames deduplicated"
        );
        self.emit(AnalysisEvent::FramesReduced {
            analysis_id: id,
            original: outcome.original_count,
            retained: outcome.frames.len(),
        });

        let decisions = serde_json::to_value(&outcome.decisions).unwrap_or_default();
        ledger.record_all(
            DEDUP_SOURCE,
            [
                Signal::new(
                    keys::FRAMES_ORIGINAL,
                    outcome.original_count as f64,
                    1.0,
                    DEDUP_SOURCE,
                )
                .with_tag(tags::FRAMES),
                Signal::new(
                    keys::FRAMES_RETAINED,
                    outcome.frames.len() as f64,
                    1.0,
                    DEDUP_SOURCE,
                )
                .with_tag(tags::FRAMES),
                Signal::new(
                    keys::FRAMES_DECISIONS,
                    SignalValue::Record(decisions),
                    1.0,
                    DEDUP_SOURCE,
                )
                .with_tag(tags::FRAMES),
            ],
        );

        image.frames = outcome.frames;
        Ok(image)
    }

    /// Run one band to completion and record every wave's output
    async fn run_band(
        &self,
        id: Uuid,
        waves: Vec<Arc<dyn Wave>>,
        ctx: WaveContext,
        ledger: &Arc<SignalLedger>,
        semaphore: &Arc<Semaphore>,
    ) -> AnalysisResult<()> {
        let mut tasks = JoinSet::new();

        for wave in waves {
            let ctx = ctx.clone();
            let ledger = Arc::clone(ledger);
            let semaphore = Arc::clone(semaphore);
            let limit = wave.timeout().unwrap_or_else(|| ctx.config.wave_timeout());

            tasks.spawn(async move {
                let name = wave.name().to_string();
                let critical = wave.is_critical();
                let started = Instant::now();

                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        let run = AssertUnwindSafe(wave.run(&ctx, &ledger)).catch_unwind();
                        tokio::select! {
                            biased;
                            _ = ctx.cancel.cancelled() => Err(WaveError::Cancelled),
                            res = tokio::time::timeout(limit, run) => match res {
                                Ok(Ok(inner)) => inner,
                                Ok(Err(payload)) => Err(WaveError::Panicked(panic_message(payload))),
                                Err(_) => Err(WaveError::Timeout(limit.as_millis() as u64)),
                            },
                        }
                    }
                    Err(_) => Err(WaveError::Failed("wave scheduler closed".to_string())),
                };

                WaveRun {
                    name,
                    critical,
                    result,
                    elapsed: started.elapsed(),
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let run = match joined {
                Ok(run) => run,
                Err(e) => {
                    // Panics are caught inside the task; only aborts land here
                    warn!(analysis_id = %id, error = %e, "Wave task aborted");
                    continue;
                }
            };

            match run.result {
                Ok(signals) => {
                    let count = ledger.record_all(&run.name, signals);
                    debug!(
                        analysis_id = %id,
                        wave = %run.name,
                        signals = count,
                        elapsed_ms = run.elapsed.as_millis() as u64,
                        "Wave completed"
                    );
                    self.emit(AnalysisEvent::WaveCompleted {
                        analysis_id: id,
                        wave: run.name,
                        signals: count,
                        duration_ms: run.elapsed.as_millis() as u64,
                    });
                }
                Err(WaveError::Cancelled) => {
                    debug!(analysis_id = %id, wave = %run.name, "Wave cancelled");
                }
                Err(e) => {
                    warn!(analysis_id = %id, wave = %run.name, error = %e, "Wave failed");
                    ledger.record(
                        &run.name,
                        Signal::failure(keys::WAVE_ERROR, run.name.as_str(), e.to_string())
                            .with_meta("error_kind", e.kind())
                            .with_meta("wave", run.name.as_str()),
                    );
                    self.emit(AnalysisEvent::WaveFailed {
                        analysis_id: id,
                        wave: run.name.clone(),
                        error: e.to_string(),
                    });

                    if run.critical {
                        error!(analysis_id = %id, wave = %run.name, "Critical wave failed, aborting analysis");
                        tasks.abort_all();
                        return Err(AnalysisError::CriticalWaveFailed {
                            wave: run.name,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
