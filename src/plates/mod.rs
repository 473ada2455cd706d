// src/plates/mod.rs
//
// Plate-based identity resolution:
//   crop → recognizer → ledger vote → store lookup → ReassignmentEvent

pub mod crop;
pub mod ledger;
pub mod recognizer;
pub mod store;
pub mod worker;

pub use recognizer::RemoteOcrClient;
pub use store::{JsonFilePlateStore, MemoryPlateStore, PlateStore};
pub use worker::{EnqueueOutcome, OcrPipeline, ShutdownReport};
