//! Recovery of faces the full-frame pass missed.
//!
//! Each person box without a face inside it is re-probed: the head and
//! shoulders band is cropped, upscaled when narrow, and handed to the face
//! engine. Faces found there are mapped back into source coordinates.

use image::RgbImage;
use serde::Deserialize;

use crate::detect::{BoundingBox, DetectionRecord, Embedding, FaceBox, FaceRecord};
use crate::error::Result;
use crate::frame::{upscale_to_min_width, Frame};
use crate::inference::FaceEngineGuard;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Band start above the person box, as a fraction of its height.
    pub top_margin: f32,
    /// Band end below the person box top, as a fraction of its height.
    pub head_ratio: f32,
    /// Crops narrower than this are upscaled before probing.
    pub min_crop_width: u32,
    /// Upper bound on probes per frame. `None` probes every unmatched person.
    pub max_probes: Option<usize>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            top_margin: 0.1,
            head_ratio: 0.4,
            min_crop_width: 160,
            max_probes: None,
        }
    }
}

pub struct FaceObjectFusion {
    config: FusionConfig,
}

impl FaceObjectFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Head/shoulders band probed for a person box, before clipping.
    pub fn probe_region(&self, person: &BoundingBox) -> BoundingBox {
        let h = person.height();
        BoundingBox::new(
            person.x1,
            person.y1 - self.config.top_margin * h,
            person.x2,
            person.y1 + self.config.head_ratio * h,
        )
    }

    /// Return `faces` plus any faces recovered inside unmatched person boxes.
    ///
    /// Probe failures are logged and skipped; they never discard the faces
    /// already found.
    pub fn recover_missing_faces(
        &self,
        frame: &Frame,
        persons: &[DetectionRecord],
        faces: Vec<FaceRecord>,
        engine: &FaceEngineGuard,
    ) -> Vec<FaceRecord> {
        let mut faces = faces;
        let limit = self.config.max_probes.unwrap_or(usize::MAX);
        let mut probes = 0;

        for person in persons.iter().filter(|p| p.is_primary()) {
            let covered = faces.iter().any(|face| {
                let (cx, cy) = face.bbox.center();
                person.bbox.contains_point(cx, cy)
            });
            if covered {
                continue;
            }
            if probes >= limit {
                log::debug!("fusion: probe limit {} reached", limit);
                break;
            }
            probes += 1;
            match self.probe(frame, &person.bbox, engine) {
                Ok(found) => faces.extend(found),
                Err(err) => log::debug!("fusion: probe skipped: {}", err),
            }
        }
        faces
    }

    fn probe(
        &self,
        frame: &Frame,
        person: &BoundingBox,
        engine: &FaceEngineGuard,
    ) -> Result<Vec<FaceRecord>> {
        let (crop, origin) = frame.crop(&self.probe_region(person))?;
        let (crop, scale) = upscale_to_min_width(crop, self.config.min_crop_width);

        let located = locate_and_encode(engine, &crop)?;
        let mut recovered = Vec::with_capacity(located.len());
        for (face, embedding) in located {
            let Some(bbox) = to_source(&face, scale, &origin, frame) else {
                log::debug!("fusion: recovered face {:?} left the frame", face);
                continue;
            };
            let mut record = FaceRecord::new(bbox);
            record.embedding = embedding;
            recovered.push(record);
        }
        Ok(recovered)
    }
}

/// Locate faces in `image` and encode them in one guarded call.
///
/// Embeddings are dropped when the engine returns a different count than
/// it located.
pub(crate) fn locate_and_encode(
    engine: &FaceEngineGuard,
    image: &RgbImage,
) -> Result<Vec<(FaceBox, Option<Embedding>)>> {
    let (boxes, embeddings) = engine.with_exclusive(|engine| {
        let boxes = engine.locate_faces(image)?;
        if boxes.is_empty() {
            return Ok((boxes, Vec::new()));
        }
        let embeddings = engine.encode(image, &boxes)?;
        Ok((boxes, embeddings))
    })?;
    if embeddings.len() == boxes.len() {
        Ok(boxes.into_iter().zip(embeddings.into_iter().map(Some)).collect())
    } else {
        Ok(boxes.into_iter().map(|b| (b, None)).collect())
    }
}

/// Undo the upscale, then the crop offset, then clip to the frame.
fn to_source(face: &FaceBox, scale: f32, origin: &BoundingBox, frame: &Frame) -> Option<FaceBox> {
    let unscaled = face.scaled(1.0 / scale);
    FaceBox::new(
        unscaled.top + origin.y1,
        unscaled.right + origin.x1,
        unscaled.bottom + origin.y1,
        unscaled.left + origin.x1,
    )
    .clip(frame.width(), frame.height())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{FaceEngine, ScriptedFaceEngine};
    use crate::inference::InferenceGuard;

    fn frame() -> Frame {
        Frame::new(RgbImage::new(640, 480), 1)
    }

    fn person() -> DetectionRecord {
        DetectionRecord::new("person", 0.9, BoundingBox::new(200.0, 100.0, 280.0, 400.0))
    }

    fn guard(engine: ScriptedFaceEngine) -> FaceEngineGuard {
        let engine: Box<dyn FaceEngine> = Box::new(engine);
        InferenceGuard::new("face", engine)
    }

    #[test]
    fn recovered_face_maps_back_inside_person() {
        let fusion = FaceObjectFusion::new(FusionConfig::default());
        let engine = guard(ScriptedFaceEngine::head_finder(160));
        let faces = fusion.recover_missing_faces(&frame(), &[person()], Vec::new(), &engine);

        assert_eq!(faces.len(), 1);
        let face = &faces[0];
        let (cx, cy) = face.bbox.center();
        assert!(person().bbox.contains_point(cx, cy));
        // Band y 70..220 at 2x: face spans crop rows 60..180, so source 100..160.
        assert!((face.bbox.top - 100.0).abs() < 1e-3);
        assert!((face.bbox.bottom - 160.0).abs() < 1e-3);
        assert!((face.bbox.left - 228.0).abs() < 1e-3);
        assert!((face.bbox.right - 252.0).abs() < 1e-3);
        assert!(face.embedding.is_some());
    }

    #[test]
    fn person_with_face_is_not_probed() {
        let fusion = FaceObjectFusion::new(FusionConfig::default());
        let engine = guard(ScriptedFaceEngine::head_finder(160));
        let existing = FaceRecord::new(FaceBox::new(110.0, 250.0, 150.0, 230.0));
        let faces =
            fusion.recover_missing_faces(&frame(), &[person()], vec![existing.clone()], &engine);
        assert_eq!(faces, vec![existing]);
        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn non_person_boxes_are_ignored() {
        let fusion = FaceObjectFusion::new(FusionConfig::default());
        let engine = guard(ScriptedFaceEngine::head_finder(160));
        let chair = DetectionRecord::new("chair", 0.9, BoundingBox::new(10.0, 10.0, 90.0, 90.0));
        assert!(fusion
            .recover_missing_faces(&frame(), &[chair], Vec::new(), &engine)
            .is_empty());
        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn engine_failure_keeps_existing_faces() {
        let fusion = FaceObjectFusion::new(FusionConfig::default());
        let engine = guard(ScriptedFaceEngine::with_locator(|_| panic!("native crash")));
        let elsewhere = FaceRecord::new(FaceBox::new(10.0, 40.0, 40.0, 10.0));
        let faces =
            fusion.recover_missing_faces(&frame(), &[person()], vec![elsewhere.clone()], &engine);
        assert_eq!(faces, vec![elsewhere]);
        assert_eq!(engine.failures(), 1);
    }

    #[test]
    fn probes_are_capped_per_frame() {
        let fusion = FaceObjectFusion::new(FusionConfig {
            max_probes: Some(1),
            ..FusionConfig::default()
        });
        let engine = guard(ScriptedFaceEngine::empty());
        let other = DetectionRecord::new("person", 0.8, BoundingBox::new(400.0, 100.0, 480.0, 400.0));
        fusion.recover_missing_faces(&frame(), &[person(), other], Vec::new(), &engine);
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn person_outside_frame_is_skipped() {
        let fusion = FaceObjectFusion::new(FusionConfig::default());
        let engine = guard(ScriptedFaceEngine::head_finder(160));
        let ghost = DetectionRecord::new("person", 0.9, BoundingBox::new(700.0, 10.0, 800.0, 300.0));
        assert!(fusion
            .recover_missing_faces(&frame(), &[ghost], Vec::new(), &engine)
            .is_empty());
        assert_eq!(engine.calls(), 0);
    }
}
