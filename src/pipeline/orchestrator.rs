// src/pipeline/orchestrator.rs
//
// Per-frame orchestration:
//   1. drain reassignments → remap table (compressed) → carry risk state
//      over to the canonical id → merge plate histories
//   2. canonicalize detection ids
//   3. risk update per identity
//   4. periodic OCR sampling of wide-enough boxes
//   5. per-identity snapshot for renderers / alerting
//
// This is the only owner of the remap table and of TrackedIdentity state.

use tracing::{debug, info};

use super::event_bus::{EventBus, PipelineEvent};
use super::metrics::PipelineMetrics;
use crate::identity::IdentityRemapTable;
use crate::plates::{EnqueueOutcome, OcrPipeline, ShutdownReport};
use crate::risk::{RiskLevel, RiskSnapshot, TrackManager};
use crate::types::{bbox_width, Config, Detection, Frame, OcrConfig};

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, serde::Serialize)]
pub struct FrameReport {
    pub frame_index: u64,
    pub tracks: Vec<RiskSnapshot>,
    pub events: Vec<PipelineEvent>,
    pub ocr_enqueued: usize,
}

pub struct FrameOrchestrator {
    ocr_config: OcrConfig,
    remap: IdentityRemapTable,
    tracks: TrackManager,
    ocr: OcrPipeline,
    events: EventBus,
    metrics: PipelineMetrics,
}

impl FrameOrchestrator {
    pub fn new(config: &Config, ocr: OcrPipeline, metrics: PipelineMetrics) -> Self {
        Self {
            ocr_config: config.ocr.clone(),
            remap: IdentityRemapTable::new(),
            tracks: TrackManager::new(config.risk.clone()),
            ocr,
            events: EventBus::new(EVENT_BUS_CAPACITY),
            metrics,
        }
    }

    /// Apply every pending reassignment from the OCR worker.
    pub fn apply_reassignments(&mut self, frame_index: u64) -> usize {
        let mut applied = 0;
        for event in self.ocr.drain_reassignments() {
            let Some(remap) = self.remap.apply(event.old_id, event.new_id) else {
                debug!(
                    "Reassignment {} -> {} already resolved",
                    event.old_id, event.new_id
                );
                // Late readings for a retired id still belong to its canonical id
                self.ocr
                    .merge_history(event.old_id, self.remap.resolve(event.new_id));
                continue;
            };

            self.tracks.rekey(remap.retired, remap.canonical);

            // In-flight crops may still carry the pre-remap id
            self.ocr.merge_history(event.old_id, remap.canonical);
            self.ocr.merge_history(remap.retired, remap.canonical);

            self.events.publish(PipelineEvent::IdentityMerged {
                frame_index,
                retired: remap.retired,
                canonical: remap.canonical,
            });
            self.metrics.inc(&self.metrics.reassignments_applied);
            applied += 1;
        }
        applied
    }

    /// Run one frame. `frame` carries pixels for OCR sampling; without it
    /// only the risk layer runs.
    pub fn process_frame(
        &mut self,
        frame_index: u64,
        frame_size: (u32, u32),
        frame: Option<&Frame>,
        mut detections: Vec<Detection>,
    ) -> FrameReport {
        self.metrics.inc(&self.metrics.total_frames);
        self.metrics
            .add(&self.metrics.detections_seen, detections.len() as u64);

        self.apply_reassignments(frame_index);
        self.remap.apply_to(&mut detections);

        let (frame_width, frame_height) = frame_size;
        for transition in self
            .tracks
            .update_tracks(&detections, frame_width, frame_height)
        {
            self.metrics.inc(&self.metrics.risk_transitions);
            if transition.to == RiskLevel::Danger {
                self.metrics.inc(&self.metrics.danger_transitions);
            }
            self.events
                .publish(PipelineEvent::risk_changed(frame_index, &transition));
        }

        let ocr_enqueued = match frame {
            Some(frame) => self.sample_plates(frame_index, frame, &detections),
            None => 0,
        };

        let display_votes = self.ocr_config.display_plate_votes;
        let ocr = &self.ocr;
        let tracks = self
            .tracks
            .snapshots(|id| ocr.confirmed_plate(id, display_votes));

        FrameReport {
            frame_index,
            tracks,
            events: self.events.drain(),
            ocr_enqueued,
        }
    }

    fn sample_plates(&self, frame_index: u64, frame: &Frame, detections: &[Detection]) -> usize {
        let every = self.ocr_config.sample_every_frames.max(1);
        if frame_index % every != 0 {
            return 0;
        }

        let min_width = i64::from(self.ocr_config.min_sample_bbox_width);
        detections
            .iter()
            .filter(|det| bbox_width(&det.bbox) > min_width)
            .filter(|det| self.ocr.enqueue(frame, det.id, &det.bbox) == EnqueueOutcome::Queued)
            .count()
    }

    pub fn remap_table(&self) -> &IdentityRemapTable {
        &self.remap
    }

    pub fn shutdown(&mut self) -> ShutdownReport {
        let report = self.ocr.shutdown();
        info!("OCR pipeline shutdown: {:?}", report);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plates::recognizer::{TextCandidate, TextRecognizer};
    use crate::plates::{MemoryPlateStore, PlateStore};
    use anyhow::Result;
    use image::GrayImage;
    use std::time::{Duration, Instant};

    struct FixedRecognizer(&'static str);

    impl TextRecognizer for FixedRecognizer {
        fn recognize(&mut self, _image: &GrayImage) -> Result<Vec<TextCandidate>> {
            Ok(vec![TextCandidate::new(self.0, 0.9)])
        }
    }

    fn make_frame(index: u64) -> Frame {
        Frame {
            data: vec![90; 1000 * 500 * 3],
            width: 1000,
            height: 500,
            index,
        }
    }

    #[test]
    fn test_risk_only_without_frames() {
        let config = Config::default();
        let metrics = PipelineMetrics::new();
        let ocr = OcrPipeline::disabled(config.ocr.clone(), metrics.clone());
        let mut orchestrator = FrameOrchestrator::new(&config, ocr, metrics.clone());

        let mut danger_frame = None;
        for index in 1..=10 {
            let dets = vec![Detection::new(3, [300, 50, 700, 450], 2)];
            let report = orchestrator.process_frame(index, (1000, 500), None, dets);
            assert_eq!(report.ocr_enqueued, 0);
            if report
                .events
                .iter()
                .any(|e| matches!(e, PipelineEvent::RiskChanged { to: RiskLevel::Danger, .. }))
            {
                danger_frame = Some(index);
            }
        }
        assert_eq!(danger_frame, Some(8));
        assert_eq!(metrics.get(&metrics.danger_transitions), 1);
        assert_eq!(metrics.get(&metrics.total_frames), 10);
    }

    #[test]
    fn test_plate_match_remaps_identity() {
        let config = Config::default();
        let metrics = PipelineMetrics::new();
        let mut store = MemoryPlateStore::new();
        store.upsert(7, "AB123CD").unwrap();
        let ocr = OcrPipeline::start(
            config.ocr.clone(),
            config.store.max_pending_writes,
            Box::new(FixedRecognizer("AB-123-CD")),
            Box::new(store),
            metrics.clone(),
        )
        .unwrap();
        let mut orchestrator = FrameOrchestrator::new(&config, ocr, metrics.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut index = 0;
        let mut merged = false;
        while Instant::now() < deadline {
            index += 1;
            let frame = make_frame(index);
            let dets = vec![Detection::new(5, [100, 100, 300, 200], 2)];
            let report = orchestrator.process_frame(index, (1000, 500), Some(&frame), dets);
            if report
                .events
                .iter()
                .any(|e| matches!(e, PipelineEvent::IdentityMerged { retired: 5, canonical: 7, .. }))
            {
                merged = true;
                // Same frame already reports the canonical id
                assert_eq!(report.tracks.len(), 1);
                assert_eq!(report.tracks[0].id, 7);
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        assert!(merged, "reassignment never arrived");
        assert_eq!(orchestrator.remap.resolve(5), 7);
        assert!(orchestrator.remap_table().is_compressed());
        assert!(orchestrator.ocr.plate_snapshot(7).len() >= 2);
        assert!(matches!(orchestrator.shutdown(), ShutdownReport::Joined(_)));
    }

    #[test]
    fn test_danger_survives_identity_merge() {
        let config = Config::default();
        let metrics = PipelineMetrics::new();
        let mut store = MemoryPlateStore::new();
        store.upsert(7, "AB123CD").unwrap();
        let ocr = OcrPipeline::start(
            config.ocr.clone(),
            config.store.max_pending_writes,
            Box::new(FixedRecognizer("AB123CD")),
            Box::new(store),
            metrics.clone(),
        )
        .unwrap();
        let mut orchestrator = FrameOrchestrator::new(&config, ocr, metrics.clone());

        // Plates are sampled on frames 5 and 10, so no merge lands before frame 11
        let big = [300, 50, 700, 450];
        for index in 1..=10 {
            let frame = make_frame(index);
            let dets = vec![Detection::new(5, big, 2)];
            orchestrator.process_frame(index, (1000, 500), Some(&frame), dets);
        }
        assert_eq!(orchestrator.tracks.get(5).unwrap().state(), RiskLevel::Danger);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut index = 10;
        let mut merged = None;
        while Instant::now() < deadline {
            index += 1;
            let frame = make_frame(index);
            let dets = vec![Detection::new(5, big, 2)];
            let report = orchestrator.process_frame(index, (1000, 500), Some(&frame), dets);
            if report
                .events
                .iter()
                .any(|e| matches!(e, PipelineEvent::IdentityMerged { canonical: 7, .. }))
            {
                merged = Some(report);
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        let report = merged.expect("reassignment never arrived");
        assert_eq!(report.tracks.len(), 1);
        assert_eq!(report.tracks[0].id, 7);
        assert_eq!(report.tracks[0].level, RiskLevel::Danger);
        assert_eq!(report.tracks[0].label, "DANGER");
        // No flap through Safe on the way
        assert!(!report
            .events
            .iter()
            .any(|e| matches!(e, PipelineEvent::RiskChanged { .. })));
        orchestrator.shutdown();
    }

    #[test]
    fn test_sampling_respects_period_and_width() {
        let config = Config::default();
        let metrics = PipelineMetrics::new();
        let ocr = OcrPipeline::start(
            config.ocr.clone(),
            16,
            Box::new(FixedRecognizer("x")),
            Box::new(MemoryPlateStore::new()),
            metrics.clone(),
        )
        .unwrap();
        let mut orchestrator = FrameOrchestrator::new(&config, ocr, metrics.clone());

        let dets = || {
            vec![
                Detection::new(1, [0, 0, 71, 40], 2),  // wide enough
                Detection::new(2, [0, 0, 70, 40], 2),  // not strictly wider than 70
                Detection::new(3, [0, 0, 200, 8], 2),  // too short for a crop
            ]
        };

        let frame = make_frame(4);
        assert_eq!(orchestrator.process_frame(4, (1000, 500), Some(&frame), dets()).ocr_enqueued, 0);
        let frame = make_frame(5);
        assert_eq!(orchestrator.process_frame(5, (1000, 500), Some(&frame), dets()).ocr_enqueued, 1);
        assert_eq!(metrics.get(&metrics.ocr_rejected_small), 1);
        orchestrator.shutdown();
    }
}
