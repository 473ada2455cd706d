// src/plates/crop.rs
//
// Owned vehicle crops for the OCR worker. The producer may reuse its frame
// buffer as soon as `enqueue` returns, so every crop is a deep copy.

use image::{GrayImage, RgbImage};
use tracing::debug;

use crate::types::{BBox, Frame};

#[derive(Debug, Clone)]
pub struct PlateCrop {
    pub id: u32,
    pub image: RgbImage,
}

impl PlateCrop {
    /// Clamp `bbox` to the frame and copy the region out.
    /// Returns None when the clamped region is narrower than `min_width` or
    /// shorter than `min_height`.
    pub fn from_frame(
        frame: &Frame,
        id: u32,
        bbox: &BBox,
        min_width: u32,
        min_height: u32,
    ) -> Option<Self> {
        let fw = frame.width as i64;
        let fh = frame.height as i64;
        let x1 = (bbox[0] as i64).clamp(0, fw);
        let y1 = (bbox[1] as i64).clamp(0, fh);
        let x2 = (bbox[2] as i64).clamp(0, fw);
        let y2 = (bbox[3] as i64).clamp(0, fh);

        if x2 - x1 < min_width as i64 || y2 - y1 < min_height as i64 {
            return None;
        }

        let stride = frame.width as usize * 3;
        if frame.data.len() < stride * frame.height as usize {
            debug!(
                "Frame {} buffer too short for {}x{}",
                frame.index, frame.width, frame.height
            );
            return None;
        }

        let (x1, y1, x2, y2) = (x1 as usize, y1 as usize, x2 as usize, y2 as usize);
        let crop_w = x2 - x1;
        let crop_h = y2 - y1;
        let mut data = Vec::with_capacity(crop_w * crop_h * 3);
        for row in y1..y2 {
            let start = row * stride + x1 * 3;
            data.extend_from_slice(&frame.data[start..start + crop_w * 3]);
        }

        let image = RgbImage::from_raw(crop_w as u32, crop_h as u32, data)?;
        Some(Self { id, image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn to_grayscale(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }
}
