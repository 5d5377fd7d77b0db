//! Tesseract OCR via the command-line tool
//!
//! The frame is piped to `tesseract stdin stdout tsv` as PNG. Word rows of the
//! TSV report are grouped into lines (block, paragraph, line) and each line
//! becomes one [`OcrRegion`] with the mean word confidence.

use super::{BoundingBox, OcrEngine, OcrRegion};
use crate::error::EngineError;
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Tesseract CLI wrapper
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    command: String,
    language: String,
}

impl TesseractOcr {
    pub fn new(command: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            language: language.into(),
        }
    }
}

#[derive(Debug, Default)]
struct LineAccumulator {
    words: Vec<String>,
    confidences: Vec<f64>,
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
}

impl LineAccumulator {
    fn push(&mut self, word: &str, confidence: f64, bbox: BoundingBox) {
        if self.words.is_empty() {
            self.left = bbox.x;
            self.top = bbox.y;
        } else {
            self.left = self.left.min(bbox.x);
            self.top = self.top.min(bbox.y);
        }
        self.right = self.right.max(bbox.x + bbox.width);
        self.bottom = self.bottom.max(bbox.y + bbox.height);
        self.words.push(word.to_string());
        self.confidences.push(confidence);
    }

    fn into_region(self) -> OcrRegion {
        let confidence = self.confidences.iter().sum::<f64>() / self.confidences.len() as f64;
        OcrRegion::new(self.words.join(" "), confidence).with_bbox(BoundingBox {
            x: self.left,
            y: self.top,
            width: self.right.saturating_sub(self.left),
            height: self.bottom.saturating_sub(self.top),
        })
    }
}

/// Parse `tesseract ... tsv` output into line regions, reading order
pub(crate) fn parse_tsv(tsv: &str) -> Vec<OcrRegion> {
    let mut lines: BTreeMap<(u32, u32, u32, u32), LineAccumulator> = BTreeMap::new();

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        // level 5 = word
        if cols[0] != "5" {
            continue;
        }
        let text = cols[11].trim();
        let Ok(conf) = cols[10].parse::<f64>() else {
            continue;
        };
        if text.is_empty() || conf < 0.0 {
            continue;
        }
        let num = |i: usize| cols[i].parse::<u32>().unwrap_or(0);
        let bbox = BoundingBox {
            x: num(6),
            y: num(7),
            width: num(8),
            height: num(9),
        };
        lines
            .entry((num(1), num(2), num(3), num(4)))
            .or_default()
            .push(text, conf / 100.0, bbox);
    }

    lines.into_values().map(LineAccumulator::into_region).collect()
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn extract(&self, image: &RgbaImage) -> Result<Vec<OcrRegion>, EngineError> {
        let image = image.clone();
        let png = tokio::task::spawn_blocking(move || {
            let mut bytes = Vec::new();
            DynamicImage::ImageRgba8(image)
                .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
                .map(|_| bytes)
        })
        .await
        .map_err(|e| EngineError::ModelCallFailed(format!("PNG encode task failed: {}", e)))?
        .map_err(|e| EngineError::ModelCallFailed(format!("PNG encode failed: {}", e)))?;

        let mut child = Command::new(&self.command)
            .args(["stdin", "stdout", "-l", self.language.as_str(), "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EngineError::Unavailable(format!("'{}' not found", self.command))
                } else {
                    EngineError::Unavailable(format!("Failed to start '{}': {}", self.command, e))
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&png)
                .await
                .map_err(|e| EngineError::ModelCallFailed(format!("tesseract stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| EngineError::ModelCallFailed(format!("tesseract wait: {}", e)))?;
        if !output.status.success() {
            return Err(EngineError::ModelCallFailed(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let regions = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        debug!(regions = regions.len(), "Tesseract extraction complete");
        Ok(regions)
    }
}
