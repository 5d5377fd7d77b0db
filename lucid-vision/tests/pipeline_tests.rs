// End-to-end pipeline tests
//
// Drives the orchestrator over in-memory PNG/GIF images with mock engines:
// - Priority bands and ledger visibility between bands
// - Failure isolation (error, panic, timeout) and critical waves
// - Cancellation and decode failures never populate the cache
// - Tiered text extraction through the text wave
// - Content-addressed caching of finished ledgers
// - Animation frame deduplication

mod helpers;

use helpers::*;
use lucid_common::events::{AnalysisEvent, EventBus};
use lucid_vision::cache::{sha256_hex, ResultCache};
use lucid_vision::engines::{MockOcr, MockVision, OcrEngine, VisionModel};
use lucid_vision::types::{keys, Signal};
use lucid_vision::waves::{heuristic_waves, standard_waves};
use lucid_vision::{AnalysisConfig, AnalysisError, LedgerSnapshot, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn text_of(snapshot: &LedgerSnapshot, key: &str) -> Option<String> {
    snapshot
        .signals_for(key)
        .last()
        .and_then(|s| s.value.as_text().map(str::to_string))
}

fn errors(snapshot: &LedgerSnapshot) -> Vec<&Signal> {
    snapshot.signals_for(keys::WAVE_ERROR).collect()
}

fn text_orchestrator(
    ocr: Arc<MockOcr>,
    vision: Arc<MockVision>,
    cache: Option<ResultCache>,
) -> Orchestrator {
    let config = Arc::new(text_config());
    let ocr: Arc<dyn OcrEngine> = ocr;
    let vision: Arc<dyn VisionModel> = vision;
    let mut builder = Orchestrator::builder()
        .config(Arc::clone(&config))
        .waves(standard_waves(&config, Some(ocr), Some(vision), cache.clone()));
    if let Some(cache) = cache {
        builder = builder.cache(cache);
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn test_later_band_sees_earlier_signals_and_pixels_are_released() {
    let orchestrator = Orchestrator::builder()
        .waves(heuristic_waves())
        .wave(arc(WidthEchoWave))
        .build()
        .unwrap();

    let analysis = orchestrator
        .analyze_bytes(png_bytes(&solid(120, 40, 90)), CancellationToken::new())
        .await
        .unwrap();

    let snapshot = &analysis.snapshot;
    let echoed = snapshot.signals_for("echo.width").next().unwrap();
    assert_eq!(echoed.value.as_f64(), Some(120.0));

    // Last pixel-reading band (content) has finished before the echo wave runs
    let has_image = snapshot.signals_for("echo.has_image").next().unwrap();
    assert_eq!(has_image.value.as_bool(), Some(false));
    assert!(!analysis.cache_hit);
    assert_eq!(snapshot.content_hash, sha256_hex(&png_bytes(&solid(120, 40, 90))));
}

#[tokio::test]
async fn test_highest_confidence_signal_wins() {
    let low = ScriptedWave::new(
        "low",
        60,
        Script::Emit(vec![Signal::new("scene.label", "indoor", 0.4, "low")]),
    );
    let high = ScriptedWave::new(
        "high",
        60,
        Script::Emit(vec![Signal::new("scene.label", "outdoor", 0.9, "high")]),
    );
    let config = AnalysisConfig::default();
    let orchestrator = Orchestrator::builder()
        .config(config.clone())
        .wave(arc(low))
        .wave(arc(high))
        .build()
        .unwrap();

    let analysis = orchestrator
        .analyze_bytes(png_bytes(&solid(16, 16, 0)), CancellationToken::new())
        .await
        .unwrap();

    let best = analysis
        .snapshot
        .best_signal("scene.label", &config.aggregation)
        .unwrap();
    assert_eq!(best.value.as_text(), Some("outdoor"));
    assert_eq!(best.source, "high");
    assert_eq!(analysis.snapshot.signals_for("scene.label").count(), 2);
}

#[tokio::test]
async fn test_equal_priority_order_does_not_change_best_signal() {
    let config = AnalysisConfig::default();
    let make = |name: &str, value: &str, confidence: f64| {
        arc(ScriptedWave::new(
            name,
            60,
            Script::Emit(vec![Signal::new("scene.label", value, confidence, name)]),
        ))
    };

    let mut winners = Vec::new();
    for reversed in [false, true] {
        let mut waves = vec![
            make("a", "indoor", 0.3),
            make("b", "outdoor", 0.8),
            make("c", "night", 0.5),
        ];
        if reversed {
            waves.reverse();
        }
        let orchestrator = Orchestrator::builder()
            .config(config.clone())
            .waves(waves)
            .build()
            .unwrap();
        let analysis = orchestrator
            .analyze_bytes(png_bytes(&solid(8, 8, 0)), CancellationToken::new())
            .await
            .unwrap();
        let ledger = analysis.ledger(Arc::new(config.aggregation.clone()));
        winners.push(ledger.best_signal("scene.label").unwrap().source.clone());
    }

    assert_eq!(winners, vec!["b".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_failing_wave_recorded_once_and_analysis_continues() {
    let orchestrator = Orchestrator::builder()
        .waves(heuristic_waves())
        .wave(arc(ScriptedWave::new("flaky", 85, Script::Fail("boom".to_string()))))
        .build()
        .unwrap();

    let analysis = orchestrator
        .analyze_bytes(png_bytes(&solid(32, 32, 200)), CancellationToken::new())
        .await
        .unwrap();

    let errors = errors(&analysis.snapshot);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source, "flaky");
    assert_eq!(errors[0].confidence, 0.0);
    assert_eq!(
        errors[0].meta("error_kind").and_then(|m| m.as_text()),
        Some("failed")
    );

    // Lower-priority content wave still ran
    assert!(analysis
        .snapshot
        .signals_for(keys::CONTENT_TEXT_LIKELIHOOD)
        .next()
        .is_some());
}

#[tokio::test]
async fn test_panicking_wave_is_isolated() {
    let orchestrator = Orchestrator::builder()
        .waves(heuristic_waves())
        .wave(arc(ScriptedWave::new("explosive", 85, Script::Panic)))
        .build()
        .unwrap();

    let analysis = orchestrator
        .analyze_bytes(png_bytes(&solid(32, 32, 10)), CancellationToken::new())
        .await
        .unwrap();

    let errors = errors(&analysis.snapshot);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source, "explosive");
    assert_eq!(
        errors[0].meta("error_kind").and_then(|m| m.as_text()),
        Some("panic")
    );
    assert!(analysis
        .snapshot
        .signals_for(keys::CONTENT_TEXT_LIKELIHOOD)
        .next()
        .is_some());
}

#[tokio::test]
async fn test_wave_timeout_recorded() {
    let slow = ScriptedWave::new("slow", 70, Script::Sleep(Duration::from_secs(30)))
        .with_timeout(Duration::from_millis(50));
    let orchestrator = Orchestrator::builder()
        .waves(heuristic_waves())
        .wave(arc(slow))
        .build()
        .unwrap();

    let analysis = orchestrator
        .analyze_bytes(png_bytes(&solid(24, 24, 128)), CancellationToken::new())
        .await
        .unwrap();

    let errors = errors(&analysis.snapshot);
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].meta("error_kind").and_then(|m| m.as_text()),
        Some("timeout")
    );
}

#[tokio::test]
async fn test_critical_wave_failure_aborts() {
    let cache = ResultCache::in_memory();
    let orchestrator = Orchestrator::builder()
        .wave(arc(
            ScriptedWave::new("gatekeeper", 100, Script::Fail("refused".to_string())).critical(),
        ))
        .wave(arc(ScriptedWave::new("after", 10, Script::Emit(Vec::new()))))
        .cache(cache.clone())
        .build()
        .unwrap();

    let bytes = png_bytes(&solid(8, 8, 1));
    let err = orchestrator
        .analyze_bytes(bytes.clone(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AnalysisError::CriticalWaveFailed { ref wave, .. } if wave == "gatekeeper"));
    assert!(!cache.has_ledger(&sha256_hex(&bytes)).await);
}

#[tokio::test]
async fn test_decode_failure_is_critical_and_uncached() {
    let cache = ResultCache::in_memory();
    let orchestrator = Orchestrator::builder()
        .waves(heuristic_waves())
        .cache(cache.clone())
        .build()
        .unwrap();

    let bytes = b"GIF89a but not really".to_vec();
    let err = orchestrator
        .analyze_bytes(bytes.clone(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AnalysisError::CriticalDecodeFailure(_)));
    assert!(!cache.has_ledger(&sha256_hex(&bytes)).await);
}

#[tokio::test]
async fn test_cancelled_analysis_is_not_cached() {
    let cache = ResultCache::in_memory();
    let late = Arc::new(ScriptedWave::new("late", 5, Script::Emit(Vec::new())));
    let orchestrator = Orchestrator::builder()
        .waves(heuristic_waves())
        .wave(arc(ScriptedWave::new("stuck", 70, Script::Sleep(Duration::from_secs(30)))))
        .wave(late.clone())
        .cache(cache.clone())
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let bytes = png_bytes(&solid(32, 32, 64));
    let err = orchestrator
        .analyze_bytes(bytes.clone(), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, AnalysisError::Cancelled));
    assert_eq!(late.runs(), 0);
    assert!(!cache.has_ledger(&sha256_hex(&bytes)).await);
}

#[tokio::test]
async fn test_validated_text_skips_tier3_end_to_end() {
    let ocr = Arc::new(MockOcr::with_lines(&["I'm not even mad."], 0.93));
    let vision = Arc::new(MockVision::new());
    let orchestrator = text_orchestrator(ocr.clone(), vision.clone(), None);

    let analysis = orchestrator
        .analyze_bytes(png_bytes(&stripes(160, 90, 4)), CancellationToken::new())
        .await
        .unwrap();

    let snapshot = &analysis.snapshot;
    assert_eq!(
        text_of(snapshot, keys::TEXT_EXTRACTED).as_deref(),
        Some("I'm not even mad.")
    );
    let tier = snapshot.signals_for(keys::TEXT_TIER).next().unwrap();
    assert_eq!(tier.value.as_f64(), Some(2.0));
    assert_eq!(ocr.calls(), 1);
    assert_eq!(vision.correct_calls(), 0);
    assert!(errors(snapshot).is_empty());
}

#[tokio::test]
async fn test_known_bad_pair_escalates_end_to_end() {
    let ocr = Arc::new(MockOcr::with_lines(&["Back Bf the net"], 0.9));
    let vision = Arc::new(MockVision::new().with_correction("Back of the net"));
    let orchestrator = text_orchestrator(ocr, vision.clone(), None);

    let analysis = orchestrator
        .analyze_bytes(png_bytes(&stripes(160, 90, 4)), CancellationToken::new())
        .await
        .unwrap();

    let snapshot = &analysis.snapshot;
    assert_eq!(
        text_of(snapshot, keys::TEXT_EXTRACTED).as_deref(),
        Some("Back of the net")
    );
    let tier = snapshot.signals_for(keys::TEXT_TIER).next().unwrap();
    assert_eq!(tier.value.as_f64(), Some(3.0));
    assert_eq!(vision.correct_calls(), 1);
}

#[tokio::test]
async fn test_unlikely_text_is_read_but_not_escalated() {
    let config = Arc::new(AnalysisConfig::default());
    let ocr: Arc<dyn OcrEngine> = Arc::new(MockOcr::with_lines(&["Back Bf the net"], 0.9));
    let vision = Arc::new(MockVision::new());
    let orchestrator = Orchestrator::builder()
        .config(Arc::clone(&config))
        .waves(standard_waves(
            &config,
            Some(ocr),
            Some(vision.clone() as Arc<dyn VisionModel>),
            None,
        ))
        .build()
        .unwrap();

    // Flat gray: no text likelihood, no screenshot profile
    let analysis = orchestrator
        .analyze_bytes(png_bytes(&solid(64, 48, 128)), CancellationToken::new())
        .await
        .unwrap();

    let snapshot = &analysis.snapshot;
    assert_eq!(
        text_of(snapshot, keys::TEXT_EXTRACTED).as_deref(),
        Some("Back Bf the net")
    );
    let tier = snapshot.signals_for(keys::TEXT_TIER).next().unwrap();
    assert_eq!(tier.value.as_f64(), Some(1.0));
    let escalation = snapshot.signals_for(keys::TEXT_ESCALATION).next().unwrap();
    assert_eq!(
        escalation.meta("cap").and_then(|m| m.as_text()),
        Some("low_text_likelihood")
    );
    assert!(snapshot.signals_for(keys::TEXT_VALIDATION_SCORE).next().is_none());
    assert_eq!(vision.correct_calls(), 0);
}

#[tokio::test]
async fn test_unlikely_text_with_nothing_read_records_the_cap() {
    let config = Arc::new(AnalysisConfig::default());
    let ocr: Arc<dyn OcrEngine> = Arc::new(MockOcr::new(Vec::new()));
    let orchestrator = Orchestrator::builder()
        .config(Arc::clone(&config))
        .waves(standard_waves(&config, Some(ocr), None, None))
        .build()
        .unwrap();

    let analysis = orchestrator
        .analyze_bytes(png_bytes(&solid(32, 32, 10)), CancellationToken::new())
        .await
        .unwrap();

    let snapshot = &analysis.snapshot;
    assert!(snapshot.signals_for(keys::TEXT_EXTRACTED).next().is_none());
    assert!(snapshot.signals_for(keys::OCR_REGIONS).next().is_some());
    let escalation = snapshot.signals_for(keys::TEXT_ESCALATION).next().unwrap();
    assert_eq!(
        escalation.meta("cap").and_then(|m| m.as_text()),
        Some("low_text_likelihood")
    );
    assert!(snapshot.contributors.contains("text"));
}

#[tokio::test]
async fn test_unavailable_ocr_is_not_a_wave_error() {
    let ocr = Arc::new(MockOcr::unavailable());
    let vision = Arc::new(MockVision::new());
    let orchestrator = text_orchestrator(ocr, vision, None);

    let analysis = orchestrator
        .analyze_bytes(png_bytes(&stripes(64, 64, 2)), CancellationToken::new())
        .await
        .unwrap();

    assert!(analysis.snapshot.signals_for(keys::TEXT_EXTRACTED).next().is_none());
    assert!(analysis.snapshot.signals_for(keys::OCR_UNAVAILABLE).next().is_some());
    assert!(errors(&analysis.snapshot).is_empty());
}

#[tokio::test]
async fn test_identical_bytes_hit_cache_regardless_of_file_name() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = png_bytes(&stripes(96, 64, 3));
    let first_path = dir.path().join("holiday.png");
    let second_path = dir.path().join("copy of holiday.png");
    std::fs::write(&first_path, &bytes).unwrap();
    std::fs::write(&second_path, &bytes).unwrap();

    let cache = ResultCache::in_memory();
    let ocr = Arc::new(MockOcr::with_lines(&["Back Bf the net"], 0.9));
    let vision = Arc::new(MockVision::new().with_correction("Back of the net"));
    let orchestrator = text_orchestrator(ocr.clone(), vision.clone(), Some(cache.clone()));

    let first = orchestrator
        .analyze_path(&first_path, CancellationToken::new())
        .await
        .unwrap();
    assert!(!first.cache_hit);
    assert!(cache.has_ledger(&sha256_hex(&bytes)).await);
    let ocr_calls = ocr.calls();
    let correct_calls = vision.correct_calls();
    assert_eq!(correct_calls, 1);

    let second = orchestrator
        .analyze_path(&second_path, CancellationToken::new())
        .await
        .unwrap();
    let third = orchestrator
        .analyze_path(&first_path, CancellationToken::new())
        .await
        .unwrap();

    assert!(second.cache_hit);
    assert!(third.cache_hit);
    assert_eq!(second.snapshot, third.snapshot);
    assert_eq!(ocr.calls(), ocr_calls);
    assert_eq!(vision.correct_calls(), correct_calls);

    // Cached ledger carries the same facts as the computed one
    let keys_of = |s: &LedgerSnapshot| {
        s.signals
            .iter()
            .map(|sig| (sig.key.clone(), sig.source.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(keys_of(&first.snapshot), keys_of(&second.snapshot));
    assert_eq!(first.snapshot.contributors, second.snapshot.contributors);
    assert_eq!(
        text_of(&second.snapshot, keys::TEXT_EXTRACTED).as_deref(),
        Some("Back of the net")
    );
}

#[tokio::test]
async fn test_animation_frames_deduplicated() {
    let white = solid(48, 48, 255);
    let striped = stripes(48, 48, 4);
    let bytes = gif_bytes(&[white.clone(), white.clone(), white, striped]);

    let orchestrator = Orchestrator::builder()
        .waves(heuristic_waves())
        .build()
        .unwrap();
    let analysis = orchestrator
        .analyze_bytes(bytes, CancellationToken::new())
        .await
        .unwrap();

    let snapshot = &analysis.snapshot;
    let original = snapshot.signals_for(keys::FRAMES_ORIGINAL).next().unwrap();
    let retained = snapshot.signals_for(keys::FRAMES_RETAINED).next().unwrap();
    assert_eq!(original.value.as_f64(), Some(4.0));
    assert_eq!(retained.value.as_f64(), Some(2.0));
    assert_eq!(original.source, "frame_dedup");

    let decisions = snapshot
        .signals_for(keys::FRAMES_DECISIONS)
        .next()
        .and_then(|s| s.value.as_record().cloned())
        .unwrap();
    assert_eq!(decisions.as_array().map(Vec::len), Some(4));
}

#[tokio::test]
async fn test_events_trace_analysis_lifecycle() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let orchestrator = Orchestrator::builder()
        .waves(heuristic_waves())
        .cache(ResultCache::in_memory())
        .events(bus)
        .build()
        .unwrap();

    let bytes = png_bytes(&solid(20, 20, 30));
    orchestrator
        .analyze_bytes(bytes.clone(), CancellationToken::new())
        .await
        .unwrap();
    orchestrator
        .analyze_bytes(bytes, CancellationToken::new())
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }

    assert!(matches!(seen.first(), Some(AnalysisEvent::AnalysisStarted { .. })));
    let completed = seen
        .iter()
        .filter(|e| matches!(e, AnalysisEvent::AnalysisCompleted { .. }))
        .count();
    let bands = seen
        .iter()
        .filter(|e| matches!(e, AnalysisEvent::BandStarted { .. }))
        .count();
    let hits = seen
        .iter()
        .filter(|e| matches!(e, AnalysisEvent::CacheHit { .. }))
        .count();
    assert_eq!(completed, 1);
    // identity, color+quality, content
    assert_eq!(bands, 3);
    assert_eq!(hits, 1);
}
