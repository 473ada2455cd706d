// src/risk/state_machine.rs
//
// Per-identity collision risk with a debounced commit.
//
// Signal flow per frame:
//   bbox area → area ratio + time-to-collision proxy (area growth)
//   center    → perspective-aware lane membership
//   both      → proposed level → proposal window → committed level
//
// The proposal window is a super-majority filter: a level is only committed
// once it holds `commit_votes` of the last `proposal_window_len` proposals.

use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::types::{bbox_area, Detection, RiskConfig};

// ============================================================================
// RISK LEVEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum RiskLevel {
    Safe = 0,
    Warning = 1,
    Danger = 2,
}

/// Display style per level, indexed by discriminant: (BGR color, label)
const RISK_STYLE: [([u8; 3], &str); 3] = [
    ([0, 255, 0], "SAFE"),
    ([0, 255, 255], "WARNING"),
    ([0, 0, 255], "DANGER"),
];

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        RISK_STYLE[*self as usize].1
    }

    /// BGR color used by the HUD renderer
    pub fn color(&self) -> [u8; 3] {
        RISK_STYLE[*self as usize].0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskTransition {
    pub id: u32,
    pub from: RiskLevel,
    pub to: RiskLevel,
}

// ============================================================================
// TRACKED IDENTITY
// ============================================================================

#[derive(Debug, Clone)]
pub struct TrackedIdentity {
    pub id: u32,
    pub last_info: Detection,
    state: RiskLevel,
    area_history: VecDeque<i64>,
    proposal_window: VecDeque<RiskLevel>,
}

impl TrackedIdentity {
    pub fn new(id: u32, initial_info: Detection) -> Self {
        Self {
            id,
            last_info: initial_info,
            state: RiskLevel::Safe,
            area_history: VecDeque::new(),
            proposal_window: VecDeque::new(),
        }
    }

    pub fn state(&self) -> RiskLevel {
        self.state
    }

    #[cfg(test)]
    pub fn area_history(&self) -> &VecDeque<i64> {
        &self.area_history
    }

    #[cfg(test)]
    pub fn proposal_window(&self) -> &VecDeque<RiskLevel> {
        &self.proposal_window
    }

    /// Feed the latest detection. Returns the committed transition, if any.
    pub fn update(
        &mut self,
        info: Detection,
        frame_width: u32,
        frame_height: u32,
        config: &RiskConfig,
    ) -> Option<RiskTransition> {
        let area = bbox_area(&info.bbox);
        let frame_area = frame_width as f64 * frame_height as f64;
        let area_ratio = if frame_area > 0.0 {
            area as f64 / frame_area
        } else {
            0.0
        };

        let ttc = self.time_to_collision(area, config);
        if ttc.is_finite() {
            debug!(
                "Vehicle {}: TTC = {:.2} frames | area ratio = {:.4}",
                self.id, ttc, area_ratio
            );
        }

        self.area_history.push_back(area);
        while self.area_history.len() > config.area_history_len {
            self.area_history.pop_front();
        }

        let (cx, cy) = info.center();
        let in_lane = is_in_lane(cx, cy, frame_width, frame_height, config);
        self.last_info = info;

        let proposed = propose_level(in_lane, area_ratio, ttc, config);

        self.proposal_window.push_back(proposed);
        while self.proposal_window.len() > config.proposal_window_len {
            self.proposal_window.pop_front();
        }

        let votes = self
            .proposal_window
            .iter()
            .filter(|&&level| level == proposed)
            .count();
        if votes >= config.commit_votes {
            self.set_state(proposed)
        } else {
            None
        }
    }

    /// Area-growth based TTC proxy in frames; infinite when the object is not
    /// growing faster than the noise floor.
    fn time_to_collision(&self, area: i64, config: &RiskConfig) -> f64 {
        if self.area_history.is_empty() {
            return f64::INFINITY;
        }
        let lookback = config.ttc_lookback.max(1).min(self.area_history.len());
        let recent = self.area_history.iter().rev().take(lookback);
        let avg_prev = recent.sum::<i64>() as f64 / lookback as f64;
        let diff = area as f64 - avg_prev;

        if diff > area as f64 * config.growth_noise_floor {
            area as f64 / diff
        } else {
            f64::INFINITY
        }
    }

    fn set_state(&mut self, new_state: RiskLevel) -> Option<RiskTransition> {
        if self.state == new_state {
            return None;
        }
        let transition = RiskTransition {
            id: self.id,
            from: self.state,
            to: new_state,
        };
        if new_state == RiskLevel::Danger {
            warn!(
                "Vehicle {}: {} -> {}",
                self.id,
                self.state.as_str(),
                new_state.as_str()
            );
        } else {
            info!(
                "Vehicle {}: {} -> {}",
                self.id,
                self.state.as_str(),
                new_state.as_str()
            );
        }
        self.state = new_state;
        Some(transition)
    }
}

/// Objects lower in the frame are closer, so their apparent lane is wider.
pub fn is_in_lane(
    center_x: i32,
    center_y: i32,
    frame_width: u32,
    frame_height: u32,
    config: &RiskConfig,
) -> bool {
    if frame_height == 0 {
        return false;
    }
    let horizon_ratio = center_y as f64 / frame_height as f64;
    let lane_width = config.lane_base_width + horizon_ratio * config.lane_perspective_gain;
    let lane_start = frame_width as f64 * (0.5 - lane_width / 2.0);
    let lane_end = frame_width as f64 * (0.5 + lane_width / 2.0);
    let cx = center_x as f64;
    lane_start < cx && cx < lane_end
}

fn propose_level(in_lane: bool, area_ratio: f64, ttc: f64, config: &RiskConfig) -> RiskLevel {
    if in_lane {
        if area_ratio > config.danger_area_ratio || ttc < config.danger_ttc {
            RiskLevel::Danger
        } else if area_ratio > config.warning_area_ratio || ttc < config.warning_ttc {
            RiskLevel::Warning
        } else {
            RiskLevel::Safe
        }
    } else if area_ratio > config.side_warning_area_ratio {
        // Large object outside the lane is cutting across from the side
        RiskLevel::Warning
    } else {
        RiskLevel::Safe
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_W: u32 = 1000;
    const FRAME_H: u32 = 500;

    fn make_detection(id: u32, bbox: [i32; 4]) -> Detection {
        Detection::new(id, bbox, 2)
    }

    /// Centered box covering `ratio` of a 1000x500 frame
    fn centered_box(ratio: f64) -> [i32; 4] {
        let area = ratio * (FRAME_W * FRAME_H) as f64;
        let half_w = (area.sqrt() / 2.0).ceil() as i32;
        [500 - half_w, 250 - half_w, 500 + half_w, 250 + half_w]
    }

    #[test]
    fn test_style_table() {
        assert_eq!(RiskLevel::Safe.as_str(), "SAFE");
        assert_eq!(RiskLevel::Warning.color(), [0, 255, 255]);
        assert_eq!(RiskLevel::Danger.color(), [0, 0, 255]);
        assert_eq!(RiskLevel::Danger.as_str(), "DANGER");
    }

    #[test]
    fn test_danger_commits_on_eighth_confirming_frame() {
        let config = RiskConfig::default();
        let bbox = centered_box(0.25);
        let mut identity = TrackedIdentity::new(1, make_detection(1, bbox));

        for frame in 1..=10 {
            let transition = identity.update(make_detection(1, bbox), FRAME_W, FRAME_H, &config);
            if frame < 8 {
                assert!(transition.is_none(), "committed too early at frame {}", frame);
                assert_eq!(identity.state(), RiskLevel::Safe);
            } else if frame == 8 {
                assert_eq!(
                    transition,
                    Some(RiskTransition {
                        id: 1,
                        from: RiskLevel::Safe,
                        to: RiskLevel::Danger
                    })
                );
            } else {
                // Same-kind repeats are no-ops
                assert!(transition.is_none());
            }
        }
        assert_eq!(identity.state(), RiskLevel::Danger);
    }

    #[test]
    fn test_transient_proposals_do_not_commit() {
        let config = RiskConfig::default();
        let big = centered_box(0.25);
        let far = [900, 10, 910, 20];
        let mut identity = TrackedIdentity::new(2, make_detection(2, far));

        // Alternate danger/safe: never reaches 8 of 10
        for i in 0..30 {
            let bbox = if i % 3 == 0 { far } else { big };
            identity.update(make_detection(2, bbox), FRAME_W, FRAME_H, &config);
        }
        assert_eq!(identity.state(), RiskLevel::Safe);
    }

    #[test]
    fn test_histories_are_bounded() {
        let config = RiskConfig::default();
        let mut identity = TrackedIdentity::new(3, make_detection(3, [0, 0, 50, 50]));
        for i in 0..50 {
            identity.update(
                make_detection(3, [0, 0, 50 + i, 50]),
                FRAME_W,
                FRAME_H,
                &config,
            );
        }
        assert_eq!(identity.area_history().len(), 20);
        assert_eq!(identity.proposal_window().len(), 10);
        assert_eq!(*identity.area_history().back().unwrap(), (50 + 49) * 50);
    }

    #[test]
    fn test_ttc_growth_boundary_is_strict() {
        let config = RiskConfig::default();
        let mut identity = TrackedIdentity::new(4, make_detection(4, [0, 0, 1, 1]));

        // Exactly 5% growth over the running average stays infinite
        identity.area_history.push_back(9_500_000);
        assert!(identity.time_to_collision(10_000_000, &config).is_infinite());

        // 5.00001% growth produces a finite TTC
        identity.area_history.clear();
        identity.area_history.push_back(9_499_999);
        let ttc = identity.time_to_collision(10_000_000, &config);
        assert!(ttc.is_finite());
        assert!((ttc - 10_000_000.0 / 500_001.0).abs() < 1e-9);
    }

    #[test]
    fn test_ttc_averages_last_five_areas() {
        let config = RiskConfig::default();
        let mut identity = TrackedIdentity::new(5, make_detection(5, [0, 0, 1, 1]));
        for area in [1, 1, 100, 100, 100, 100, 100] {
            identity.area_history.push_back(area);
        }
        // avg of last five = 100, diff = 100
        assert!((identity.time_to_collision(200, &config) - 2.0).abs() < 1e-12);
        assert!(identity.time_to_collision(50, &config).is_infinite());
    }

    #[test]
    fn test_lane_bounds_with_perspective() {
        let config = RiskConfig::default();
        // horizon 0.5 → lane width 0.20 → lane (400, 600)
        assert!(!is_in_lane(399, 250, FRAME_W, FRAME_H, &config));
        assert!(is_in_lane(401, 250, FRAME_W, FRAME_H, &config));
        assert!(is_in_lane(599, 250, FRAME_W, FRAME_H, &config));
        assert!(!is_in_lane(601, 250, FRAME_W, FRAME_H, &config));
        // Bottom of frame → lane width 0.30 → (350, 650)
        assert!(is_in_lane(360, 500, FRAME_W, FRAME_H, &config));
    }

    #[test]
    fn test_fast_approach_in_lane_is_danger() {
        let config = RiskConfig::default();
        // small box but ttc < 3
        assert_eq!(propose_level(true, 0.01, 2.0, &config), RiskLevel::Danger);
        assert_eq!(propose_level(true, 0.01, 10.0, &config), RiskLevel::Warning);
        assert_eq!(propose_level(true, 0.16, f64::INFINITY, &config), RiskLevel::Warning);
        assert_eq!(propose_level(true, 0.01, f64::INFINITY, &config), RiskLevel::Safe);
    }

    #[test]
    fn test_out_of_lane_only_warns_when_huge() {
        let config = RiskConfig::default();
        assert_eq!(propose_level(false, 0.46, 1.0, &config), RiskLevel::Warning);
        assert_eq!(propose_level(false, 0.30, 1.0, &config), RiskLevel::Safe);
    }

    #[test]
    fn test_zero_area_box_is_safe() {
        let config = RiskConfig::default();
        let degenerate = [500, 250, 500, 250];
        let mut identity = TrackedIdentity::new(6, make_detection(6, degenerate));
        for _ in 0..12 {
            assert!(identity
                .update(make_detection(6, degenerate), FRAME_W, FRAME_H, &config)
                .is_none());
        }
        assert_eq!(identity.state(), RiskLevel::Safe);
        assert!(identity.proposal_window().iter().all(|&l| l == RiskLevel::Safe));
    }
}
