use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub risk: RiskConfig,
    pub ocr: OcrConfig,
    pub store: StoreConfig,
    pub replay: ReplayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub area_history_len: usize,
    pub proposal_window_len: usize,
    /// Votes inside the proposal window needed to commit a level
    pub commit_votes: usize,
    /// Number of most recent areas averaged for the growth estimate
    pub ttc_lookback: usize,
    /// Growth below this fraction of the current area is treated as jitter
    pub growth_noise_floor: f64,
    pub danger_area_ratio: f64,
    pub danger_ttc: f64,
    pub warning_area_ratio: f64,
    pub warning_ttc: f64,
    /// Out-of-lane objects above this ratio are cutting across from the side
    pub side_warning_area_ratio: f64,
    pub lane_base_width: f64,
    pub lane_perspective_gain: f64,
    /// Frames an identity survives without being reported (0 = dropped at once)
    pub max_missed_frames: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            area_history_len: 20,
            proposal_window_len: 10,
            commit_votes: 8,
            ttc_lookback: 5,
            growth_noise_floor: 0.05,
            danger_area_ratio: 0.20,
            danger_ttc: 3.0,
            warning_area_ratio: 0.15,
            warning_ttc: 15.0,
            side_warning_area_ratio: 0.45,
            lane_base_width: 0.10,
            lane_perspective_gain: 0.20,
            max_missed_frames: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub enabled: bool,
    pub min_crop_width: u32,
    pub min_crop_height: u32,
    pub sample_every_frames: u64,
    pub min_sample_bbox_width: i32,
    pub queue_capacity: usize,
    pub min_confidence: f32,
    pub min_plate_len: usize,
    pub max_plate_len: usize,
    pub history_len: usize,
    /// Plate histories kept before the least recently touched one is evicted
    pub max_plate_identities: usize,
    pub confirm_votes: usize,
    /// Votes a plate needs before it is shown next to its identity
    pub display_plate_votes: usize,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub drain_on_shutdown: bool,
    pub engine_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_crop_width: 40,
            min_crop_height: 10,
            sample_every_frames: 5,
            min_sample_bbox_width: 70,
            queue_capacity: 64,
            min_confidence: 0.35,
            min_plate_len: 5,
            max_plate_len: 8,
            history_len: 10,
            max_plate_identities: 512,
            confirm_votes: 2,
            display_plate_votes: 3,
            poll_interval_ms: 50,
            shutdown_timeout_ms: 2000,
            drain_on_shutdown: false,
            engine_url: None,
            request_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
    pub max_pending_writes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "plates.json".to_string(),
            max_pending_writes: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub detections_path: String,
    pub frames_dir: Option<String>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub output_path: Option<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            detections_path: "detections.jsonl".to_string(),
            frames_dir: None,
            frame_width: 1280,
            frame_height: 720,
            output_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "safedrive=info".to_string(),
        }
    }
}

/// Packed RGB frame (3 bytes per pixel, row-major)
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub index: u64,
}

/// Axis-aligned box in pixel coordinates `[x1, y1, x2, y2]`
pub type BBox = [i32; 4];

// Coordinates come straight from tracker output, so all box math widens to
// i64 first.

pub fn bbox_width(bbox: &BBox) -> i64 {
    i64::from(bbox[2]) - i64::from(bbox[0])
}

/// Area of the box; inverted or degenerate boxes count as zero.
pub fn bbox_area(bbox: &BBox) -> i64 {
    let w = bbox_width(bbox).max(0);
    let h = (i64::from(bbox[3]) - i64::from(bbox[1])).max(0);
    w.saturating_mul(h)
}

pub fn bbox_center(bbox: &BBox) -> (i32, i32) {
    // The midpoint of two i32 values always fits back into i32
    let mid = |a: i32, b: i32| ((i64::from(a) + i64::from(b)) / 2) as i32;
    (mid(bbox[0], bbox[2]), mid(bbox[1], bbox[3]))
}

/// One tracked object as reported by the external detector/tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: u32,
    pub bbox: BBox,
    #[serde(default)]
    pub class_id: u32,
    #[serde(default)]
    pub center: Option<(i32, i32)>,
}

impl Detection {
    pub fn new(id: u32, bbox: BBox, class_id: u32) -> Self {
        Self {
            id,
            bbox,
            class_id,
            center: Some(bbox_center(&bbox)),
        }
    }

    pub fn center(&self) -> (i32, i32) {
        self.center.unwrap_or_else(|| bbox_center(&self.bbox))
    }
}
