// src/main.rs

mod config;
mod identity;
mod pipeline;
mod plates;
mod replay;
mod risk;
mod types;

use anyhow::{Context, Result};
use pipeline::{FrameOrchestrator, PipelineEvent, PipelineMetrics};
use plates::{JsonFilePlateStore, MemoryPlateStore, OcrPipeline, PlateStore, RemoteOcrClient};
use replay::{DetectionSource, FrameDirectory, JsonlDetectionReplay};
use risk::RiskLevel;
use std::fs::File;
use std::io::{BufWriter, Write};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use types::Config;

fn main() -> Result<()> {
    let config_path =
        std::env::var("SAFEDRIVE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = Config::load_or_default(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚗 SafeDrive risk & identity layer starting");
    info!("✓ Configuration loaded from {}", config_path);

    let metrics = PipelineMetrics::new();
    let ocr = build_ocr_pipeline(&config, &metrics)?;
    let mut orchestrator = FrameOrchestrator::new(&config, ocr, metrics.clone());

    let mut source = JsonlDetectionReplay::open(&config.replay.detections_path)?;
    let frames = config
        .replay
        .frames_dir
        .as_ref()
        .map(FrameDirectory::open)
        .transpose()?;
    match &frames {
        None => info!("No frames directory configured, plate recognition will not sample"),
        Some(dir) if dir.is_empty() => {
            warn!("Frames directory has no images, plate recognition will not sample")
        }
        Some(_) => {}
    }

    let mut output = match &config.replay.output_path {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
            info!("💾 Frame reports will be written to: {}", path);
            Some(BufWriter::new(file))
        }
        None => None,
    };

    while let Some(tracked) = source.next_frame()? {
        let frame = match &frames {
            Some(dir) => dir.load(tracked.frame).unwrap_or_else(|e| {
                warn!("Frame {} unavailable: {:#}", tracked.frame, e);
                None
            }),
            None => None,
        };
        let frame_size = frame
            .as_ref()
            .map(|f| (f.width, f.height))
            .unwrap_or((config.replay.frame_width, config.replay.frame_height));

        let report =
            orchestrator.process_frame(tracked.frame, frame_size, frame.as_ref(), tracked.detections);

        for event in &report.events {
            announce(event);
        }

        if let Some(out) = output.as_mut() {
            serde_json::to_writer(&mut *out, &report)?;
            writeln!(out)?;
        }
    }

    if let Some(mut out) = output {
        out.flush()?;
    }
    if source.skipped() > 0 {
        warn!("{} malformed detection lines skipped", source.skipped());
    }

    orchestrator.shutdown();
    let identities_merged = orchestrator.remap_table().len();

    let summary = metrics.summary();
    info!("\n✓ Replay finished");
    info!("  Frames: {} ({:.1} fps)", summary.total_frames, summary.fps);
    info!(
        "  Risk transitions: {} ({} to DANGER)",
        summary.risk_transitions, summary.danger_transitions
    );
    info!(
        "  OCR: {} queued, {} too small, {} dropped (queue full), {} failures",
        summary.ocr_enqueued, summary.ocr_rejected_small, summary.ocr_dropped_full, summary.ocr_failures
    );
    info!(
        "  Plates: {} read, {} confirmations, {} reassignments applied ({} ids retired)",
        summary.plates_read,
        summary.plates_confirmed,
        summary.reassignments_applied,
        identities_merged
    );
    if summary.store_failures > 0 {
        warn!(
            "  Store failures: {} ({} writes replayed)",
            summary.store_failures, summary.store_writes_replayed
        );
    }

    Ok(())
}

fn build_ocr_pipeline(config: &Config, metrics: &PipelineMetrics) -> Result<OcrPipeline> {
    if !config.ocr.enabled {
        info!("Plate recognition disabled");
        return Ok(OcrPipeline::disabled(config.ocr.clone(), metrics.clone()));
    }
    let Some(url) = &config.ocr.engine_url else {
        warn!("No OCR engine_url configured, plate recognition disabled");
        return Ok(OcrPipeline::disabled(config.ocr.clone(), metrics.clone()));
    };

    let recognizer = RemoteOcrClient::new(url.clone(), config.ocr.request_timeout_secs)?;
    info!("📡 OCR engine: {}", recognizer.server_url());

    let store: Box<dyn PlateStore> = match JsonFilePlateStore::open(&config.store.path) {
        Ok(store) => Box::new(store),
        Err(e) => {
            error!("Plate store unavailable, continuing in memory only: {:#}", e);
            Box::new(MemoryPlateStore::new())
        }
    };

    OcrPipeline::start(
        config.ocr.clone(),
        config.store.max_pending_writes,
        Box::new(recognizer),
        store,
        metrics.clone(),
    )
}

fn announce(event: &PipelineEvent) {
    match event {
        PipelineEvent::RiskChanged {
            frame_index,
            id,
            to: RiskLevel::Danger,
            ..
        } => {
            warn!("🚨 DANGER: vehicle {} on collision course (frame {})", id, frame_index);
        }
        PipelineEvent::RiskChanged { .. } => {}
        PipelineEvent::IdentityMerged {
            frame_index,
            retired,
            canonical,
        } => {
            info!(
                "🔗 Identity {} is vehicle {} (frame {})",
                retired, canonical, frame_index
            );
        }
    }
}
