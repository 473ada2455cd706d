// src/plates/ledger.rs
//
// Bounded per-identity plate history with plurality voting.

use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Outcome of the vote after a new reading was recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateVote {
    pub plate: String,
    pub count: usize,
    pub total: usize,
}

impl PlateVote {
    pub fn is_confirmed(&self, min_votes: usize) -> bool {
        self.count >= min_votes
    }
}

#[derive(Debug, Clone, Default)]
struct PlateHistory {
    readings: VecDeque<String>,
    /// Ledger clock at the last reading or merge
    touched: u64,
}

/// Plate readings per identity.
///
/// Ids the tracker has abandoned never get cleaned up by a merge, so once more
/// than `max_identities` ids hold a history the one touched longest ago is
/// evicted.
#[derive(Debug, Clone)]
pub struct PlateLedger {
    history_len: usize,
    max_identities: usize,
    clock: u64,
    histories: HashMap<u32, PlateHistory>,
}

impl PlateLedger {
    pub fn new(history_len: usize, max_identities: usize) -> Self {
        Self {
            history_len: history_len.max(1),
            max_identities: max_identities.max(1),
            clock: 0,
            histories: HashMap::new(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Append a reading for `id` and return the plurality winner of its history.
    pub fn record(&mut self, id: u32, plate: &str) -> PlateVote {
        let now = self.tick();
        let history = self.histories.entry(id).or_default();
        history.touched = now;
        history.readings.push_back(plate.to_string());
        while history.readings.len() > self.history_len {
            history.readings.pop_front();
        }
        // History is non-empty here, so a winner always exists
        let vote = plurality(&history.readings).unwrap_or(PlateVote {
            plate: plate.to_string(),
            count: 1,
            total: 1,
        });
        self.evict_idle(id);
        vote
    }

    /// Append `old_id`'s readings after `new_id`'s, keeping the last `history_len`.
    pub fn merge_history(&mut self, old_id: u32, new_id: u32) {
        if old_id == new_id {
            return;
        }
        let Some(old) = self.histories.remove(&old_id) else {
            return;
        };
        let now = self.tick();
        let target = self.histories.entry(new_id).or_default();
        target.touched = now;
        target.readings.extend(old.readings);
        while target.readings.len() > self.history_len {
            target.readings.pop_front();
        }
        debug!("Merged plate history of {} into {}", old_id, new_id);
    }

    fn evict_idle(&mut self, keep: u32) {
        while self.histories.len() > self.max_identities {
            let Some(stale) = self
                .histories
                .iter()
                .filter(|(id, _)| **id != keep)
                .min_by_key(|(_, h)| h.touched)
                .map(|(id, _)| *id)
            else {
                return;
            };
            self.histories.remove(&stale);
            debug!("Evicted idle plate history of {}", stale);
        }
    }

    pub fn history(&self, id: u32) -> Vec<String> {
        self.histories
            .get(&id)
            .map(|h| h.readings.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn vote(&self, id: u32) -> Option<PlateVote> {
        self.histories.get(&id).and_then(|h| plurality(&h.readings))
    }

    /// Plurality plate of `id` if it has at least `min_votes` readings.
    pub fn confirmed_plate(&self, id: u32, min_votes: usize) -> Option<String> {
        self.vote(id)
            .filter(|v| v.is_confirmed(min_votes))
            .map(|v| v.plate)
    }
}

/// Most frequent plate; ties go to the plate seen first.
fn plurality(history: &VecDeque<String>) -> Option<PlateVote> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for plate in history {
        match counts.iter_mut().find(|(p, _)| *p == plate.as_str()) {
            Some((_, n)) => *n += 1,
            None => counts.push((plate.as_str(), 1)),
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (plate, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((plate, count));
        }
    }
    best.map(|(plate, count)| PlateVote {
        plate: plate.to_string(),
        count,
        total: history.len(),
    })
}
