// src/plates/worker.rs
//
// Asynchronous plate recognition and identity resolution.
//
//   frame loop ──enqueue(crop)──► bounded task queue ──► OCR worker thread
//        ▲                                                   │ recognize → ledger vote
//        └──────── drain_reassignments() ◄── reassignments ◄─┘ confirmed → store lookup
//
// The worker is the only writer of new plate readings. The frame loop only
// merges histories and reads snapshots, both under the ledger lock.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::crop::PlateCrop;
use super::ledger::PlateLedger;
use super::recognizer::{select_plate, PlateRules, TextRecognizer};
use super::store::PlateStore;
use crate::pipeline::PipelineMetrics;
use crate::types::{BBox, Frame, OcrConfig};

/// Two ids found to be the same physical vehicle; `old_id` retires into `new_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ReassignmentEvent {
    pub old_id: u32,
    pub new_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    TooSmall,
    QueueFull,
    Disabled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub discarded_on_shutdown: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReport {
    NotRunning,
    Joined(WorkerStats),
    TimedOut,
    Panicked,
}

// ============================================================================
// WORKER
// ============================================================================

pub struct PlateWorker {
    recognizer: Box<dyn TextRecognizer>,
    store: Box<dyn PlateStore>,
    ledger: Arc<Mutex<PlateLedger>>,
    reassign_tx: Sender<ReassignmentEvent>,
    rules: PlateRules,
    confirm_votes: usize,
    pending_writes: VecDeque<(u32, String)>,
    max_pending_writes: usize,
    metrics: PipelineMetrics,
}

impl PlateWorker {
    pub fn new(
        config: &OcrConfig,
        max_pending_writes: usize,
        recognizer: Box<dyn TextRecognizer>,
        store: Box<dyn PlateStore>,
        ledger: Arc<Mutex<PlateLedger>>,
        reassign_tx: Sender<ReassignmentEvent>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            recognizer,
            store,
            ledger,
            reassign_tx,
            rules: PlateRules::from_config(config),
            confirm_votes: config.confirm_votes,
            pending_writes: VecDeque::new(),
            max_pending_writes,
            metrics,
        }
    }

    fn run(
        mut self,
        task_rx: Receiver<PlateCrop>,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
        drain_on_shutdown: bool,
    ) -> WorkerStats {
        let mut stats = WorkerStats::default();

        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            match task_rx.recv_timeout(poll_interval) {
                Ok(crop) => {
                    self.process(crop);
                    stats.processed += 1;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if drain_on_shutdown {
            for crop in task_rx.try_iter() {
                self.process(crop);
                stats.processed += 1;
            }
        } else {
            stats.discarded_on_shutdown = task_rx.try_iter().count() as u64;
        }

        if !self.pending_writes.is_empty() {
            self.replay_pending_writes();
            if !self.pending_writes.is_empty() {
                warn!(
                    "{} plate writes still unpersisted at shutdown",
                    self.pending_writes.len()
                );
            }
        }

        info!(
            "OCR worker stopped ({} processed, {} discarded)",
            stats.processed, stats.discarded_on_shutdown
        );
        stats
    }

    /// Recognize one crop. Never fails: a bad crop just yields no reading.
    pub fn process(&mut self, crop: PlateCrop) {
        let id = crop.id;
        let started = Instant::now();
        let gray = crop.to_grayscale();

        let recognizer = &mut self.recognizer;
        let result = catch_unwind(AssertUnwindSafe(|| recognizer.recognize(&gray)));
        self.metrics.set_timing(
            &self.metrics.ocr_time_us,
            started.elapsed().as_micros() as u64,
        );

        let candidates = match result {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                warn!("OCR error for ID {}: {:#}", id, e);
                self.metrics.inc(&self.metrics.ocr_failures);
                return;
            }
            Err(_) => {
                error!("OCR engine panicked on crop for ID {}, task dropped", id);
                self.metrics.inc(&self.metrics.ocr_failures);
                return;
            }
        };

        match select_plate(candidates, &self.rules) {
            Some(plate) => self.handle_reading(id, &plate),
            None => self.metrics.inc(&self.metrics.ocr_no_reading),
        }
    }

    /// Record a reading and act on confirmation.
    ///
    /// Confirmation is re-evaluated on every reading: once the plurality plate
    /// has `confirm_votes` entries, every further reading for this identity
    /// triggers another store lookup.
    pub fn handle_reading(&mut self, id: u32, plate: &str) {
        let vote = self.ledger.lock().record(id, plate);
        self.metrics.inc(&self.metrics.plates_read);

        if !vote.is_confirmed(self.confirm_votes) {
            return;
        }
        info!(
            "Confirmed plate for ID {}: {} ({}/{})",
            id, vote.plate, vote.count, vote.total
        );
        self.metrics.inc(&self.metrics.plates_confirmed);

        self.replay_pending_writes();

        match self.store.lookup_by_plate(&vote.plate) {
            Ok(Some(existing)) if existing != id => {
                info!(
                    "Plate '{}' already bound to ID {}, reassigning {} -> {}",
                    vote.plate, existing, id, existing
                );
                let event = ReassignmentEvent {
                    old_id: id,
                    new_id: existing,
                };
                if self.reassign_tx.send(event).is_ok() {
                    self.metrics.inc(&self.metrics.reassignments_emitted);
                } else {
                    debug!("Reassignment receiver gone, dropping {:?}", event);
                }
            }
            Ok(Some(_)) => {
                debug!("Plate '{}' already bound to ID {}", vote.plate, id);
            }
            Ok(None) => {
                info!("New plate '{}' for ID {}", vote.plate, id);
                self.persist(id, &vote.plate);
            }
            Err(e) => {
                warn!("Plate store lookup failed for '{}': {:#}", vote.plate, e);
                self.metrics.inc(&self.metrics.store_failures);
            }
        }
    }

    fn persist(&mut self, id: u32, plate: &str) {
        if let Err(e) = self.store.upsert(id, plate) {
            warn!("Plate store write failed for '{}': {:#}", plate, e);
            self.metrics.inc(&self.metrics.store_failures);
            self.queue_pending_write(id, plate);
        }
    }

    fn queue_pending_write(&mut self, id: u32, plate: &str) {
        self.pending_writes.retain(|(_, p)| p != plate);
        self.pending_writes.push_back((id, plate.to_string()));
        while self.pending_writes.len() > self.max_pending_writes {
            if let Some((lost_id, lost_plate)) = self.pending_writes.pop_front() {
                warn!("Dropping unpersisted plate '{}' for ID {}", lost_plate, lost_id);
            }
        }
    }

    /// Retry failed writes in order; stop at the first failure.
    fn replay_pending_writes(&mut self) {
        while let Some((id, plate)) = self.pending_writes.front() {
            match self.store.upsert(*id, plate) {
                Ok(()) => {
                    info!("Replayed plate write '{}' for ID {}", plate, id);
                    self.metrics.inc(&self.metrics.store_writes_replayed);
                    self.pending_writes.pop_front();
                }
                Err(e) => {
                    debug!("Plate store still unavailable: {:#}", e);
                    break;
                }
            }
        }
    }
}

// ============================================================================
// PIPELINE HANDLE
// ============================================================================

/// Frame-loop side of the OCR pipeline
pub struct OcrPipeline {
    config: OcrConfig,
    task_tx: Option<Sender<PlateCrop>>,
    reassign_rx: Receiver<ReassignmentEvent>,
    ledger: Arc<Mutex<PlateLedger>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<WorkerStats>>,
    metrics: PipelineMetrics,
}

impl OcrPipeline {
    pub fn start(
        config: OcrConfig,
        max_pending_writes: usize,
        recognizer: Box<dyn TextRecognizer>,
        store: Box<dyn PlateStore>,
        metrics: PipelineMetrics,
    ) -> Result<Self> {
        let (task_tx, task_rx) = bounded(config.queue_capacity.max(1));
        let (reassign_tx, reassign_rx) = unbounded();
        let ledger = Arc::new(Mutex::new(PlateLedger::new(config.history_len, config.max_plate_identities)));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = PlateWorker::new(
            &config,
            max_pending_writes,
            recognizer,
            store,
            Arc::clone(&ledger),
            reassign_tx,
            metrics.clone(),
        );
        let poll_interval = Duration::from_millis(config.poll_interval_ms.max(1));
        let drain = config.drain_on_shutdown;
        let worker_shutdown = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("ocr-worker".to_string())
            .spawn(move || worker.run(task_rx, worker_shutdown, poll_interval, drain))
            .context("Failed to spawn OCR worker thread")?;

        info!(
            "OCR worker started (queue capacity {})",
            config.queue_capacity.max(1)
        );

        Ok(Self {
            config,
            task_tx: Some(task_tx),
            reassign_rx,
            ledger,
            shutdown,
            worker: Some(handle),
            metrics,
        })
    }

    /// Pipeline without a worker: enqueue is a no-op, nothing is ever reassigned.
    pub fn disabled(config: OcrConfig, metrics: PipelineMetrics) -> Self {
        let (_, reassign_rx) = unbounded();
        Self {
            ledger: Arc::new(Mutex::new(PlateLedger::new(config.history_len, config.max_plate_identities))),
            config,
            task_tx: None,
            reassign_rx,
            shutdown: Arc::new(AtomicBool::new(true)),
            worker: None,
            metrics,
        }
    }

    /// Copy the bbox region of `frame` and queue it for recognition. Never blocks.
    pub fn enqueue(&self, frame: &Frame, id: u32, bbox: &BBox) -> EnqueueOutcome {
        let Some(task_tx) = &self.task_tx else {
            return EnqueueOutcome::Disabled;
        };

        let Some(crop) = PlateCrop::from_frame(
            frame,
            id,
            bbox,
            self.config.min_crop_width,
            self.config.min_crop_height,
        ) else {
            self.metrics.inc(&self.metrics.ocr_rejected_small);
            return EnqueueOutcome::TooSmall;
        };

        match task_tx.try_send(crop) {
            Ok(()) => {
                self.metrics.inc(&self.metrics.ocr_enqueued);
                EnqueueOutcome::Queued
            }
            Err(TrySendError::Full(_)) => {
                debug!("OCR queue full, dropping crop for ID {}", id);
                self.metrics.inc(&self.metrics.ocr_dropped_full);
                EnqueueOutcome::QueueFull
            }
            Err(TrySendError::Disconnected(_)) => EnqueueOutcome::Disabled,
        }
    }

    /// Take every pending reassignment without blocking.
    pub fn drain_reassignments(&self) -> Vec<ReassignmentEvent> {
        self.reassign_rx.try_iter().collect()
    }

    pub fn merge_history(&self, old_id: u32, new_id: u32) {
        self.ledger.lock().merge_history(old_id, new_id);
    }

    /// Copy of `id`'s plate history taken under the ledger lock
    pub fn plate_snapshot(&self, id: u32) -> Vec<String> {
        self.ledger.lock().history(id)
    }

    pub fn confirmed_plate(&self, id: u32, min_votes: usize) -> Option<String> {
        self.ledger.lock().confirmed_plate(id, min_votes)
    }

    /// Signal the worker, then wait up to `shutdown_timeout_ms` for it to exit.
    pub fn shutdown(&mut self) -> ShutdownReport {
        self.shutdown.store(true, Ordering::Release);
        self.task_tx = None;

        let Some(handle) = self.worker.take() else {
            return ShutdownReport::NotRunning;
        };

        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    "OCR worker did not stop within {} ms, detaching",
                    self.config.shutdown_timeout_ms
                );
                return ShutdownReport::TimedOut;
            }
            thread::sleep(Duration::from_millis(5));
        }

        match handle.join() {
            Ok(stats) => ShutdownReport::Joined(stats),
            Err(_) => {
                error!("OCR worker panicked");
                ShutdownReport::Panicked
            }
        }
    }
}

impl Drop for OcrPipeline {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
