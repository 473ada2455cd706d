// src/risk/track_manager.rs
//
// Owns every TrackedIdentity. Identities are created on first sighting and
// expire once the external tracker has stopped reporting them for more than
// `max_missed_frames` frames.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::state_machine::{RiskLevel, RiskTransition, TrackedIdentity};
use crate::types::{BBox, Detection, RiskConfig};

/// Per-identity view handed to renderers and alert consumers
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RiskSnapshot {
    pub id: u32,
    pub bbox: BBox,
    pub class_id: u32,
    pub level: RiskLevel,
    pub label: &'static str,
    pub color: [u8; 3],
    pub plate: Option<String>,
}

struct ManagedTrack {
    identity: TrackedIdentity,
    missed_frames: u32,
}

pub struct TrackManager {
    config: RiskConfig,
    tracks: HashMap<u32, ManagedTrack>,
}

impl TrackManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
        }
    }

    /// Update every reported identity and expire the ones that went missing.
    /// Returns the risk transitions committed this frame.
    pub fn update_tracks(
        &mut self,
        detections: &[Detection],
        frame_width: u32,
        frame_height: u32,
    ) -> Vec<RiskTransition> {
        let mut transitions = Vec::new();
        let mut seen: HashSet<u32> = HashSet::with_capacity(detections.len());

        for det in detections {
            // Two ephemeral ids can resolve to the same canonical id in one frame
            if !seen.insert(det.id) {
                debug!("Identity {} reported twice this frame, keeping first", det.id);
                continue;
            }

            let track = self.tracks.entry(det.id).or_insert_with(|| {
                debug!("New identity {}", det.id);
                ManagedTrack {
                    identity: TrackedIdentity::new(det.id, det.clone()),
                    missed_frames: 0,
                }
            });
            track.missed_frames = 0;

            if let Some(t) =
                track
                    .identity
                    .update(det.clone(), frame_width, frame_height, &self.config)
            {
                transitions.push(t);
            }
        }

        let max_missed = self.config.max_missed_frames;
        self.tracks.retain(|id, track| {
            if seen.contains(id) {
                return true;
            }
            track.missed_frames += 1;
            if track.missed_frames > max_missed {
                debug!("Identity {} expired after {} missed frames", id, track.missed_frames);
                false
            } else {
                true
            }
        });

        transitions
    }

    /// Carry a retired identity's risk state over to its canonical id.
    ///
    /// When both ids are tracked the higher-risk identity survives, the
    /// canonical one on a tie.
    pub fn rekey(&mut self, retired: u32, canonical: u32) {
        if retired == canonical {
            return;
        }
        let Some(mut track) = self.tracks.remove(&retired) else {
            return;
        };

        let keep_existing = self
            .tracks
            .get(&canonical)
            .is_some_and(|existing| existing.identity.state() >= track.identity.state());
        if keep_existing {
            debug!("Identity {} dropped, {} keeps its risk state", retired, canonical);
            return;
        }

        debug!(
            "Identity {} carries {:?} over to {}",
            retired,
            track.identity.state(),
            canonical
        );
        track.identity.id = canonical;
        track.identity.last_info.id = canonical;
        self.tracks.insert(canonical, track);
    }

    #[cfg(test)]
    pub fn get(&self, id: u32) -> Option<&TrackedIdentity> {
        self.tracks.get(&id).map(|t| &t.identity)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Snapshot of the identities reported in the latest frame, ordered by id.
    /// `plate_for` supplies the displayed plate, if any.
    pub fn snapshots<F>(&self, mut plate_for: F) -> Vec<RiskSnapshot>
    where
        F: FnMut(u32) -> Option<String>,
    {
        let mut out: Vec<RiskSnapshot> = self
            .tracks
            .values()
            .filter(|t| t.missed_frames == 0)
            .map(|t| {
                let level = t.identity.state();
                RiskSnapshot {
                    id: t.identity.id,
                    bbox: t.identity.last_info.bbox,
                    class_id: t.identity.last_info.class_id,
                    level,
                    label: level.as_str(),
                    color: level.color(),
                    plate: plate_for(t.identity.id),
                }
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }
}
