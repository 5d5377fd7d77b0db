//! lucid-vision - image analysis command line
//!
//! Analyses each file argument and prints one JSON document per image
//! containing the finished signal ledger.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lucid_common::events::{AnalysisEvent, EventBus};
use lucid_vision::cache::{FileCacheStore, ResultCache};
use lucid_vision::engines::{OcrEngine, OllamaVision, TesseractOcr, VisionModel};
use lucid_vision::waves::standard_waves;
use lucid_vision::{LucidToml, Orchestrator};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Command-line arguments for lucid-vision
#[derive(Parser, Debug)]
#[command(name = "lucid-vision")]
#[command(about = "Signal-based image analysis")]
#[command(version)]
struct Args {
    /// Image files to analyse
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Config file (overrides LUCID_CONFIG and the platform default)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Result cache directory
    #[arg(long, env = "LUCID_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Disable the result cache
    #[arg(long)]
    no_cache: bool,

    /// Ask the vision model for a caption
    #[arg(long)]
    caption: bool,

    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut toml, source) =
        LucidToml::load(args.config.as_deref()).context("Failed to load configuration")?;
    lucid_common::logging::init_tracing(&toml.logging)?;

    info!("Starting lucid-vision {}", env!("CARGO_PKG_VERSION"));
    match source.path() {
        Some(path) => info!(config = %path.display(), "Configuration loaded"),
        None => info!("Using compiled default configuration"),
    }

    if args.caption {
        toml.analysis.caption_enabled = true;
    }
    let config = Arc::new(toml.analysis.clone());

    let ocr: Option<Arc<dyn OcrEngine>> = toml.engines.tesseract_command.as_ref().map(|cmd| {
        Arc::new(TesseractOcr::new(cmd.clone(), toml.engines.tesseract_language.clone()))
            as Arc<dyn OcrEngine>
    });

    let vision: Option<Arc<dyn VisionModel>> = match &toml.engines.ollama_url {
        Some(url) => {
            let model = OllamaVision::new(
                url.clone(),
                toml.engines.vision_model.clone(),
                toml.engines.embedding_model.clone(),
                toml.engines.vision_requests_per_second,
            )
            .context("Failed to create vision model client")?;
            Some(Arc::new(model) as Arc<dyn VisionModel>)
        }
        None => {
            if config.caption_enabled {
                warn!("Captioning requested but no ollama_url configured");
            }
            None
        }
    };

    let cache = if args.no_cache {
        None
    } else {
        let dir = args
            .cache_dir
            .clone()
            .or_else(|| toml.cache.directory.clone())
            .or_else(lucid_common::config::platform_cache_dir);
        match dir {
            Some(dir) => {
                info!(cache_dir = %dir.display(), "Result cache enabled");
                Some(ResultCache::with_format_version(
                    Arc::new(FileCacheStore::new(dir)),
                    config.cache_format_version,
                ))
            }
            None => {
                warn!("No cache directory available, result cache disabled");
                None
            }
        }
    };

    let event_bus = EventBus::new(100);
    let mut events = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let AnalysisEvent::WaveFailed { wave, error, .. } = &event {
                warn!(wave = %wave, error = %error, "Wave failed");
            } else {
                debug!(event = ?event, "Analysis event");
            }
        }
    });

    let mut builder = Orchestrator::builder()
        .config(Arc::clone(&config))
        .waves(standard_waves(&config, ocr, vision, cache.clone()))
        .events(event_bus);
    if let Some(cache) = cache {
        builder = builder.cache(cache);
    }
    let orchestrator = builder.build()?;

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling analysis");
            ctrl_c_token.cancel();
        }
    });

    let mut failures = 0usize;
    for path in &args.files {
        if cancel.is_cancelled() {
            break;
        }
        match orchestrator.analyze_path(path, cancel.clone()).await {
            Ok(analysis) => {
                let doc = serde_json::json!({
                    "path": path.display().to_string(),
                    "analysis_id": analysis.id,
                    "cache_hit": analysis.cache_hit,
                    "duration_ms": analysis.duration_ms,
                    "ledger": analysis.snapshot,
                });
                let out = if args.pretty {
                    serde_json::to_string_pretty(&doc)?
                } else {
                    serde_json::to_string(&doc)?
                };
                println!("{}", out);
            }
            Err(e) => {
                failures += 1;
                error!(path = %path.display(), error = %e, "Analysis failed");
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} images failed", failures, args.files.len());
    }
    Ok(())
}
