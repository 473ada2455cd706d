// src/plates/recognizer.rs
//
// Text recognition seam and plate candidate selection.
//
// The recognition engine itself is external. `RemoteOcrClient` talks to an
// HTTP OCR service; tests plug in scripted recognizers.

use anyhow::{Context, Result};
use base64::Engine;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::debug;

use crate::types::OcrConfig;

/// One ranked reading returned by the recognition engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCandidate {
    /// Polygon of the text region in crop coordinates
    #[serde(default)]
    pub region: Vec<(f32, f32)>,
    pub text: String,
    pub confidence: f32,
}

impl TextCandidate {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            region: Vec::new(),
            text: text.to_string(),
            confidence,
        }
    }
}

pub trait TextRecognizer: Send {
    /// Candidates in engine order (not necessarily sorted).
    fn recognize(&mut self, image: &GrayImage) -> Result<Vec<TextCandidate>>;
}

#[derive(Debug, Clone, Copy)]
pub struct PlateRules {
    pub min_confidence: f32,
    pub min_len: usize,
    pub max_len: usize,
}

impl PlateRules {
    pub fn from_config(config: &OcrConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            min_len: config.min_plate_len,
            max_len: config.max_plate_len,
        }
    }

    pub fn is_valid_plate(&self, text: &str) -> bool {
        let len = text.chars().count();
        len >= self.min_len && len <= self.max_len
    }
}

impl Default for PlateRules {
    fn default() -> Self {
        Self::from_config(&OcrConfig::default())
    }
}

/// Keep alphanumerics only, uppercased.
pub fn clean_plate_text(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Highest-confidence candidate whose cleaned text looks like a plate.
pub fn select_plate(mut candidates: Vec<TextCandidate>, rules: &PlateRules) -> Option<String> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    candidates.into_iter().find_map(|c| {
        let cleaned = clean_plate_text(&c.text);
        if rules.is_valid_plate(&cleaned) && c.confidence > rules.min_confidence {
            debug!("OCR saw '{}' (prob={:.2})", cleaned, c.confidence);
            Some(cleaned)
        } else {
            None
        }
    })
}

// ============================================================================
// REMOTE OCR CLIENT
// ============================================================================

#[derive(Debug, Serialize)]
struct OcrRequest {
    /// Base64 PNG of the grayscale crop
    image_base64: String,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    candidates: Vec<TextCandidate>,
}

pub struct RemoteOcrClient {
    http_client: reqwest::blocking::Client,
    server_url: String,
}

impl RemoteOcrClient {
    pub fn new(server_url: String, timeout_secs: u64) -> Result<Self> {
        let http_client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            server_url,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl TextRecognizer for RemoteOcrClient {
    fn recognize(&mut self, image: &GrayImage) -> Result<Vec<TextCandidate>> {
        let url = format!("{}/ocr", self.server_url.trim_end_matches('/'));

        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, image::ImageFormat::Png)
            .context("Failed to encode crop")?;

        let request = OcrRequest {
            image_base64: base64::engine::general_purpose::STANDARD.encode(png.into_inner()),
            width: image.width(),
            height: image.height(),
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .with_context(|| format!("OCR request to {} failed", url))?
            .error_for_status()
            .context("OCR server returned an error status")?;

        let parsed: OcrResponse = response
            .json()
            .context("Failed to parse OCR response")?;
        Ok(parsed.candidates)
    }
}
