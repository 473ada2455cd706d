// src/pipeline/metrics.rs
//
// Counters shared between the frame loop and the OCR worker. Cloning is
// cheap; every clone points at the same atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_frames: Arc<AtomicU64>,
    pub detections_seen: Arc<AtomicU64>,
    pub risk_transitions: Arc<AtomicU64>,
    pub danger_transitions: Arc<AtomicU64>,
    pub ocr_enqueued: Arc<AtomicU64>,
    pub ocr_rejected_small: Arc<AtomicU64>,
    pub ocr_dropped_full: Arc<AtomicU64>,
    pub ocr_failures: Arc<AtomicU64>,
    pub ocr_no_reading: Arc<AtomicU64>,
    pub plates_read: Arc<AtomicU64>,
    pub plates_confirmed: Arc<AtomicU64>,
    pub reassignments_emitted: Arc<AtomicU64>,
    pub reassignments_applied: Arc<AtomicU64>,
    pub store_failures: Arc<AtomicU64>,
    pub store_writes_replayed: Arc<AtomicU64>,
    pub ocr_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            total_frames: Arc::new(AtomicU64::new(0)),
            detections_seen: Arc::new(AtomicU64::new(0)),
            risk_transitions: Arc::new(AtomicU64::new(0)),
            danger_transitions: Arc::new(AtomicU64::new(0)),
            ocr_enqueued: Arc::new(AtomicU64::new(0)),
            ocr_rejected_small: Arc::new(AtomicU64::new(0)),
            ocr_dropped_full: Arc::new(AtomicU64::new(0)),
            ocr_failures: Arc::new(AtomicU64::new(0)),
            ocr_no_reading: Arc::new(AtomicU64::new(0)),
            plates_read: Arc::new(AtomicU64::new(0)),
            plates_confirmed: Arc::new(AtomicU64::new(0)),
            reassignments_emitted: Arc::new(AtomicU64::new(0)),
            reassignments_applied: Arc::new(AtomicU64::new(0)),
            store_failures: Arc::new(AtomicU64::new(0)),
            store_writes_replayed: Arc::new(AtomicU64::new(0)),
            ocr_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn get(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn fps(&self) -> f64 {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_frames: self.get(&self.total_frames),
            fps: self.fps(),
            detections_seen: self.get(&self.detections_seen),
            risk_transitions: self.get(&self.risk_transitions),
            danger_transitions: self.get(&self.danger_transitions),
            ocr_enqueued: self.get(&self.ocr_enqueued),
            ocr_rejected_small: self.get(&self.ocr_rejected_small),
            ocr_dropped_full: self.get(&self.ocr_dropped_full),
            ocr_failures: self.get(&self.ocr_failures),
            ocr_no_reading: self.get(&self.ocr_no_reading),
            plates_read: self.get(&self.plates_read),
            plates_confirmed: self.get(&self.plates_confirmed),
            reassignments_emitted: self.get(&self.reassignments_emitted),
            reassignments_applied: self.get(&self.reassignments_applied),
            store_failures: self.get(&self.store_failures),
            store_writes_replayed: self.get(&self.store_writes_replayed),
            last_ocr_us: self.get(&self.ocr_time_us),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub total_frames: u64,
    pub fps: f64,
    pub detections_seen: u64,
    pub risk_transitions: u64,
    pub danger_transitions: u64,
    pub ocr_enqueued: u64,
    pub ocr_rejected_small: u64,
    pub ocr_dropped_full: u64,
    pub ocr_failures: u64,
    pub ocr_no_reading: u64,
    pub plates_read: u64,
    pub plates_confirmed: u64,
    pub reassignments_emitted: u64,
    pub reassignments_applied: u64,
    pub store_failures: u64,
    pub store_writes_replayed: u64,
    pub last_ocr_us: u64,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = PipelineMetrics::new();
        let worker_side = metrics.clone();
        worker_side.inc(&worker_side.plates_read);
        worker_side.add(&worker_side.plates_read, 2);
        metrics.inc(&metrics.total_frames);

        let summary = metrics.summary();
        assert_eq!(summary.plates_read, 3);
        assert_eq!(summary.total_frames, 1);
    }
}
