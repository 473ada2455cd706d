// src/risk/mod.rs

pub mod state_machine;
pub mod track_manager;

pub use state_machine::{RiskLevel, RiskTransition};
pub use track_manager::{RiskSnapshot, TrackManager};
