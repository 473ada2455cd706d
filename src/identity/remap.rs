// src/identity/remap.rs
//
// Retired ephemeral id → canonical id.
//
// Every target in the table is a root (never itself a key), so resolution
// is a single lookup and the table can never hold a cycle.

use std::collections::HashMap;
use tracing::info;

use crate::types::Detection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedRemap {
    /// Root that was retired by this merge
    pub retired: u32,
    pub canonical: u32,
}

#[derive(Debug, Clone, Default)]
pub struct IdentityRemapTable {
    map: HashMap<u32, u32>,
}

impl IdentityRemapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, id: u32) -> u32 {
        self.map.get(&id).copied().unwrap_or(id)
    }

    /// Record that `old_id` and `new_id` are the same vehicle.
    ///
    /// Both ids are resolved first; the root of `old_id` retires into the root
    /// of `new_id` and every entry that pointed at the retired root is
    /// rewritten. Returns None when both already share a root.
    pub fn apply(&mut self, old_id: u32, new_id: u32) -> Option<AppliedRemap> {
        let retired = self.resolve(old_id);
        let canonical = self.resolve(new_id);
        if retired == canonical {
            return None;
        }

        for target in self.map.values_mut() {
            if *target == retired {
                *target = canonical;
            }
        }
        self.map.insert(retired, canonical);
        debug_assert!(self.is_compressed());

        info!("Identity {} -> {} (requested {} -> {})", retired, canonical, old_id, new_id);
        Some(AppliedRemap { retired, canonical })
    }

    /// Rewrite every detection id to its canonical id.
    pub fn apply_to(&self, detections: &mut [Detection]) {
        for det in detections.iter_mut() {
            det.id = self.resolve(det.id);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no target is itself remapped
    pub fn is_compressed(&self) -> bool {
        self.map.values().all(|t| !self.map.contains_key(t))
    }
}
