// src/pipeline/event_bus.rs
//
// Decoupled event system. The frame loop publishes risk transitions and
// identity merges; alerting and output consumers drain them once per frame.

use std::collections::VecDeque;
use tracing::warn;

use crate::risk::{RiskLevel, RiskTransition};

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RiskChanged {
        frame_index: u64,
        id: u32,
        from: RiskLevel,
        to: RiskLevel,
    },

    IdentityMerged {
        frame_index: u64,
        retired: u32,
        canonical: u32,
    },
}

impl PipelineEvent {
    pub fn risk_changed(frame_index: u64, transition: &RiskTransition) -> Self {
        Self::RiskChanged {
            frame_index,
            id: transition.id,
            from: transition.from,
            to: transition.to,
        }
    }
}

pub struct EventBus {
    events: VecDeque<PipelineEvent>,
    max_pending: usize,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending,
        }
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        if self.events.len() >= self.max_pending {
            warn!(
                "Event bus full ({} events), dropping oldest",
                self.max_pending
            );
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        self.events.drain(..).collect()
    }
}
