use anyhow::{anyhow, Result};
use image::RgbImage;
use std::collections::VecDeque;

use crate::detect::backend::{FaceEngine, ObjectDetector};
use crate::detect::geometry::FaceBox;
use crate::detect::result::{DetectionRecord, Embedding};
use crate::frame::Frame;

/// Deterministic object detector for tests and dry runs.
///
/// Queued responses are returned first, one per call; afterwards every call
/// returns the fixed response.
#[derive(Default)]
pub struct ScriptedObjectDetector {
    queued: VecDeque<std::result::Result<Vec<DetectionRecord>, String>>,
    fixed: Vec<DetectionRecord>,
    calls: u64,
}

impl ScriptedObjectDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixed(detections: Vec<DetectionRecord>) -> Self {
        Self {
            fixed: detections,
            ..Self::default()
        }
    }

    pub fn push_response(&mut self, detections: Vec<DetectionRecord>) {
        self.queued.push_back(Ok(detections));
    }

    pub fn push_failure(&mut self, reason: &str) {
        self.queued.push_back(Err(reason.to_string()));
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl ObjectDetector for ScriptedObjectDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(
        &mut self,
        _frame: &Frame,
        confidence_threshold: f32,
        _iou_threshold: f32,
    ) -> Result<Vec<DetectionRecord>> {
        self.calls += 1;
        let detections = match self.queued.pop_front() {
            Some(Ok(detections)) => detections,
            Some(Err(reason)) => return Err(anyhow!(reason)),
            None => self.fixed.clone(),
        };
        Ok(detections
            .into_iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .collect())
    }
}

type Locator = Box<dyn FnMut(&RgbImage) -> Vec<FaceBox> + Send>;

/// Deterministic face engine for tests and dry runs.
///
/// Faces are produced by a locator closure over the probed image; embeddings
/// are the normalized face centers.
pub struct ScriptedFaceEngine {
    locator: Locator,
    locate_calls: u64,
}

impl ScriptedFaceEngine {
    /// Engine that never finds a face.
    pub fn empty() -> Self {
        Self::with_locator(|_| Vec::new())
    }

    pub fn with_locator<F>(locator: F) -> Self
    where
        F: FnMut(&RgbImage) -> Vec<FaceBox> + Send + 'static,
    {
        Self {
            locator: Box::new(locator),
            locate_calls: 0,
        }
    }

    /// Finds one face in the upper-middle of any image at least `min_width`
    /// pixels wide, and nothing in narrower ones.
    pub fn head_finder(min_width: u32) -> Self {
        Self::with_locator(move |image| {
            if image.width() < min_width {
                return Vec::new();
            }
            let w = image.width() as f32;
            let h = image.height() as f32;
            vec![FaceBox::new(h * 0.2, w * 0.65, h * 0.6, w * 0.35)]
        })
    }

    pub fn locate_calls(&self) -> u64 {
        self.locate_calls
    }
}

impl FaceEngine for ScriptedFaceEngine {
    fn name(&self) -> &'static str {
        "scripted-face"
    }

    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>> {
        self.locate_calls += 1;
        Ok((self.locator)(image))
    }

    fn encode(&mut self, image: &RgbImage, boxes: &[FaceBox]) -> Result<Vec<Embedding>> {
        let w = image.width().max(1) as f32;
        let h = image.height().max(1) as f32;
        Ok(boxes
            .iter()
            .map(|b| {
                let (cx, cy) = b.center();
                Embedding(vec![cx / w, cy / h])
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn scripted_detector_replays_queue_then_fixed() {
        let person = DetectionRecord::new("person", 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        let mut detector = ScriptedObjectDetector::with_fixed(vec![person.clone()]);
        detector.push_response(Vec::new());
        detector.push_failure("boom");

        let frame = Frame::new(RgbImage::new(8, 8), 0);
        assert!(detector.detect(&frame, 0.3, 0.5).unwrap().is_empty());
        assert!(detector.detect(&frame, 0.3, 0.5).is_err());
        assert_eq!(detector.detect(&frame, 0.3, 0.5).unwrap(), vec![person]);
        assert!(detector.detect(&frame, 0.95, 0.5).unwrap().is_empty());
        assert_eq!(detector.calls(), 4);
    }

    #[test]
    fn head_finder_ignores_narrow_images() {
        let mut engine = ScriptedFaceEngine::head_finder(160);
        assert!(engine.locate_faces(&RgbImage::new(80, 80)).unwrap().is_empty());
        let faces = engine.locate_faces(&RgbImage::new(160, 100)).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(engine.encode(&RgbImage::new(160, 100), &faces).unwrap().len(), 1);
    }
}
