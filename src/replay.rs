// src/replay.rs
//
// Stand-in for the external detector/tracker: replays pre-computed tracker
// output (one JSON object per frame) and, optionally, the matching frame
// images so plate crops can be taken.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Lines};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::types::{Detection, Frame};

#[derive(Debug, Clone, Deserialize)]
pub struct TrackedFrame {
    pub frame: u64,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

pub trait DetectionSource {
    /// Next frame of tracker output, or None at end of stream.
    fn next_frame(&mut self) -> Result<Option<TrackedFrame>>;
}

pub struct JsonlDetectionReplay {
    lines: Lines<BufReader<File>>,
    line_no: usize,
    skipped: usize,
}

impl JsonlDetectionReplay {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open detections {}", path.display()))?;
        info!("Replaying tracker output from {}", path.display());
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            skipped: 0,
        })
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl DetectionSource for JsonlDetectionReplay {
    fn next_frame(&mut self) -> Result<Option<TrackedFrame>> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line = match line {
                Ok(line) => line,
                // The bad line has been consumed, reading resumes after it
                Err(e) if e.kind() == ErrorKind::InvalidData => {
                    warn!("Skipping non UTF-8 line {}", self.line_no);
                    self.skipped += 1;
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read line {}", self.line_no))
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TrackedFrame>(&line) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => {
                    // Malformed rows are skipped, not fatal
                    warn!("Skipping malformed line {}: {}", self.line_no, e);
                    self.skipped += 1;
                }
            }
        }
        Ok(None)
    }
}

/// Ordered frame images; frame N is the N-th file by name.
pub struct FrameDirectory {
    paths: Vec<PathBuf>,
}

impl FrameDirectory {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            anyhow::bail!("Frame directory {} does not exist", dir.display());
        }

        let image_extensions = ["jpg", "jpeg", "png", "bmp"];
        let mut paths: Vec<PathBuf> = WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| image_extensions.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        info!("Found {} frame images in {}", paths.len(), dir.display());
        Ok(Self { paths })
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn load(&self, index: u64) -> Result<Option<Frame>> {
        let Some(path) = self.paths.get(index as usize) else {
            return Ok(None);
        };
        let rgb = image::open(path)
            .with_context(|| format!("Failed to decode {}", path.display()))?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Some(Frame {
            data: rgb.into_raw(),
            width,
            height,
            index,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("safedrive-replay-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_jsonl_replay_skips_malformed_lines() {
        let dir = temp_dir("jsonl");
        let path = dir.join("dets.jsonl");
        fs::write(
            &path,
            concat!(
                r#"{"frame": 0, "detections": [{"id": 1, "bbox": [0, 0, 10, 10], "class_id": 2}]}"#,
                "\n\nnot json\n",
                r#"{"frame": 1}"#,
                "\n"
            ),
        )
        .unwrap();

        let mut replay = JsonlDetectionReplay::open(&path).unwrap();
        let first = replay.next_frame().unwrap().unwrap();
        assert_eq!(first.frame, 0);
        assert_eq!(first.detections[0].center(), (5, 5));
        let second = replay.next_frame().unwrap().unwrap();
        assert_eq!(second.frame, 1);
        assert!(second.detections.is_empty());
        assert!(replay.next_frame().unwrap().is_none());
        assert_eq!(replay.skipped(), 1);
    }

    #[test]
    fn test_jsonl_replay_skips_invalid_utf8_lines() {
        let dir = temp_dir("utf8");
        let path = dir.join("dets.jsonl");
        let mut body = Vec::new();
        body.extend_from_slice(br#"{"frame": 0}"#);
        body.extend_from_slice(b"\n{\"frame\": \xff\xfe}\n");
        body.extend_from_slice(br#"{"frame": 2}"#);
        body.push(b'\n');
        fs::write(&path, body).unwrap();

        let mut replay = JsonlDetectionReplay::open(&path).unwrap();
        assert_eq!(replay.next_frame().unwrap().unwrap().frame, 0);
        assert_eq!(replay.next_frame().unwrap().unwrap().frame, 2);
        assert!(replay.next_frame().unwrap().is_none());
        assert_eq!(replay.skipped(), 1);
    }

    #[test]
    fn test_frame_directory_orders_and_decodes() {
        let dir = temp_dir("frames");
        for (name, shade) in [("000002.png", 30u8), ("000001.png", 10u8)] {
            image::RgbImage::from_pixel(8, 4, image::Rgb([shade, shade, shade]))
                .save(dir.join(name))
                .unwrap();
        }
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let frames = FrameDirectory::open(&dir).unwrap();
        assert_eq!(frames.paths.len(), 2);
        let first = frames.load(0).unwrap().unwrap();
        assert_eq!((first.width, first.height), (8, 4));
        assert_eq!(first.data[0], 10);
        assert!(frames.load(2).unwrap().is_none());
    }

    #[test]
    fn test_missing_frame_directory_is_error() {
        assert!(FrameDirectory::open("/nonexistent/safedrive/frames").is_err());
    }
}
