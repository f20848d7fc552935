use serde::{Deserialize, Serialize};

use super::geometry::{BoundingBox, FaceBox};

/// Label of the primary class. Tracked separately by the stabilizer and used
/// by face fusion to pick regions to re-probe.
pub const PRIMARY_CLASS: &str = "person";

/// One detected entity in one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub label: String,
    /// Confidence in `0.0..=1.0`.
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Segmentation polygon, when the detector produces one.
    pub mask: Option<Vec<(f32, f32)>>,
}

impl DetectionRecord {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
            mask: None,
        }
    }

    pub fn with_mask(mut self, mask: Vec<(f32, f32)>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn is_primary(&self) -> bool {
        self.label.eq_ignore_ascii_case(PRIMARY_CLASS)
    }

    /// Map from a scaled detector input back to source coordinates and clip.
    ///
    /// Returns `None` when the box is empty after clipping.
    pub fn rescaled(&self, factor: f32, width: u32, height: u32) -> Option<DetectionRecord> {
        let bbox = self.bbox.scaled(factor).clip(width, height)?;
        let mask = self.mask.as_ref().map(|points| {
            points
                .iter()
                .map(|&(x, y)| {
                    (
                        (x * factor).clamp(0.0, width as f32),
                        (y * factor).clamp(0.0, height as f32),
                    )
                })
                .collect()
        });
        Some(DetectionRecord {
            label: self.label.clone(),
            confidence: self.confidence,
            bbox,
            mask,
        })
    }
}

/// Face feature vector produced by the face engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    pub fn distance(&self, other: &Embedding) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentityMatch {
    pub label: String,
    pub confidence: f32,
}

/// One detected face.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub bbox: FaceBox,
    pub embedding: Option<Embedding>,
    pub identity: Option<IdentityMatch>,
}

impl FaceRecord {
    pub fn new(bbox: FaceBox) -> Self {
        Self {
            bbox,
            embedding: None,
            identity: None,
        }
    }
}
