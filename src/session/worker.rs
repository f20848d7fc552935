use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Instant, UNIX_EPOCH};

use super::sink::{AnnotatedFrame, Delivery, FrameSink};
use super::{Pipeline, SessionId, SessionSettings};
use crate::annotate::draw_overlay;
use crate::capture::CaptureHandle;
use crate::detect::{BoundingBox, DetectionRecord, FaceRecord, IdentityMatcher};
use crate::frame::{encode_jpeg, Frame, JPEG_QUALITY};
use crate::fusion::{locate_and_encode, FaceObjectFusion};
use crate::inference::InferenceEngines;
use crate::ingest::SourceId;
use crate::stabilize::DetectionStabilizer;
use crate::storage::{DetectedEntity, DetectionSink, SinkRecord};

/// Why a session loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionExit {
    /// Closed from outside (viewer left, shutdown, superseded).
    Stopped,
    ViewerDisconnected,
    /// Too many consecutive read failures.
    ErrorBudgetExhausted,
}

#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub session: SessionId,
    pub frames_read: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub read_errors: u64,
    pub engine_errors: u64,
    pub exit: SessionExit,
}

/// Per-session pipeline state: stabilizer history and the detection cache
/// drawn on every emitted frame.
pub struct SessionWorker {
    session: SessionId,
    source: SourceId,
    settings: SessionSettings,
    engines: Arc<InferenceEngines>,
    matcher: Option<Arc<dyn IdentityMatcher>>,
    detections: Option<Arc<Mutex<dyn DetectionSink>>>,
    stabilizer: DetectionStabilizer,
    fusion: FaceObjectFusion,
    cached_objects: Vec<DetectionRecord>,
    cached_faces: Vec<FaceRecord>,
    frames_read: u64,
    frames_processed: u64,
    frames_dropped: u64,
    read_errors: u64,
    engine_errors: u64,
    consecutive_errors: u32,
}

impl SessionWorker {
    pub fn new(session: SessionId, source: SourceId, pipeline: &Pipeline) -> Self {
        Self {
            session,
            source,
            settings: pipeline.settings.clone(),
            engines: Arc::clone(&pipeline.engines),
            matcher: pipeline.matcher.clone(),
            detections: pipeline.detections.clone(),
            stabilizer: DetectionStabilizer::new(pipeline.stabilizer.clone()),
            fusion: FaceObjectFusion::new(pipeline.fusion.clone()),
            cached_objects: Vec::new(),
            cached_faces: Vec::new(),
            frames_read: 0,
            frames_processed: 0,
            frames_dropped: 0,
            read_errors: 0,
            engine_errors: 0,
            consecutive_errors: 0,
        }
    }

    pub fn cached_objects(&self) -> &[DetectionRecord] {
        &self.cached_objects
    }

    pub fn cached_faces(&self) -> &[FaceRecord] {
        &self.cached_faces
    }

    pub fn engine_errors(&self) -> u64 {
        self.engine_errors
    }

    /// Drive the session until `stop` is raised, the viewer disconnects or
    /// the read error budget runs out.
    ///
    /// Each frame read completes, and releases the handle lock, before any
    /// inference call starts.
    pub fn run(
        mut self,
        handle: &CaptureHandle,
        stop: &AtomicBool,
        sink: &mut dyn FrameSink,
    ) -> SessionSummary {
        let detect_every = self.settings.detect_every.max(1);
        let frame_interval = self.settings.frame_interval();
        let health_interval = self.settings.health_interval();
        let mut last_health = Instant::now();

        log::info!("session {}: streaming {}", self.session, self.source);
        let exit = loop {
            if stop.load(Ordering::SeqCst) {
                break SessionExit::Stopped;
            }

            let frame = match handle.read_frame() {
                Ok(frame) => {
                    self.consecutive_errors = 0;
                    frame
                }
                Err(err) => {
                    self.read_errors += 1;
                    self.consecutive_errors += 1;
                    if self.consecutive_errors > self.settings.max_consecutive_errors {
                        log::error!(
                            "session {}: {} consecutive read failures, closing: {}",
                            self.session,
                            self.consecutive_errors,
                            err
                        );
                        break SessionExit::ErrorBudgetExhausted;
                    }
                    log::debug!("session {}: read failed: {}", self.session, err);
                    thread::sleep(self.settings.read_retry_delay());
                    continue;
                }
            };

            let processed = self.frames_read % detect_every == 0;
            self.frames_read += 1;
            if processed {
                self.process(&frame);
            }

            match sink.deliver(self.annotate(&frame, processed)) {
                Delivery::Delivered => {}
                Delivery::Dropped => self.frames_dropped += 1,
                Delivery::Disconnected => {
                    log::info!("session {}: viewer disconnected", self.session);
                    break SessionExit::ViewerDisconnected;
                }
            }

            if last_health.elapsed() >= health_interval {
                self.log_health(handle);
                last_health = Instant::now();
            }
            if !frame_interval.is_zero() {
                thread::sleep(frame_interval);
            }
        };

        self.log_health(handle);
        SessionSummary {
            session: self.session,
            frames_read: self.frames_read,
            frames_processed: self.frames_processed,
            frames_dropped: self.frames_dropped,
            read_errors: self.read_errors,
            engine_errors: self.engine_errors,
            exit,
        }
    }

    /// Run the detection passes on one frame and refresh the caches.
    ///
    /// A failed pass leaves its cache untouched.
    pub fn process(&mut self, frame: &Frame) {
        let engines = Arc::clone(&self.engines);
        let (objects_updated, persons) = match engines.objects.as_ref() {
            Some(_) => match self.object_pass(&engines, frame) {
                Some(persons) => (true, persons),
                None => (false, Vec::new()),
            },
            None => (false, Vec::new()),
        };
        let faces_updated = self.face_pass(&engines, frame, &persons);
        self.frames_processed += 1;

        if self.detections.is_some() {
            self.hand_off(frame, objects_updated, faces_updated);
        }
    }

    /// Returns the raw person detections in source coordinates, or `None`
    /// when the detector failed.
    fn object_pass(&mut self, engines: &InferenceEngines, frame: &Frame) -> Option<Vec<DetectionRecord>> {
        let guard = engines.objects.as_ref()?;
        let scale = self.settings.detect_scale;
        let scaled;
        let (input, back) = if scale > 0.0 && (scale - 1.0).abs() > f32::EPSILON {
            scaled = frame.scaled(scale);
            (&scaled, 1.0 / scale)
        } else {
            (frame, 1.0)
        };
        let (confidence, iou) = (self.settings.object_confidence, self.settings.object_iou);

        let raw = match guard.with_exclusive(|detector| detector.detect(input, confidence, iou)) {
            Ok(raw) => raw,
            Err(err) => {
                self.engine_errors += 1;
                log::warn!("session {}: {}", self.session, err);
                return None;
            }
        };

        let mapped: Vec<DetectionRecord> = raw
            .iter()
            .filter_map(|det| {
                let out = det.rescaled(back, frame.width(), frame.height());
                if out.is_none() {
                    log::debug!(
                        "session {}: dropped {} outside frame {:?}",
                        self.session,
                        det.label,
                        det.bbox
                    );
                }
                out
            })
            .collect();
        let persons = mapped.iter().filter(|d| d.is_primary()).cloned().collect();
        self.cached_objects = self.stabilizer.stabilize(mapped);
        Some(persons)
    }

    fn face_pass(&mut self, engines: &InferenceEngines, frame: &Frame, persons: &[DetectionRecord]) -> bool {
        let Some(guard) = engines.faces.as_ref() else {
            return false;
        };
        let target = self.settings.face_frame_width;
        let resized;
        let (image, scale) = if target > 0 && target != frame.width() {
            resized = frame.resized_to_width(target);
            (&resized.0, resized.1)
        } else {
            (frame.image(), 1.0)
        };

        let located = match locate_and_encode(guard, image) {
            Ok(located) => located,
            Err(err) => {
                self.engine_errors += 1;
                log::warn!("session {}: {}", self.session, err);
                return false;
            }
        };

        let faces: Vec<FaceRecord> = located
            .into_iter()
            .filter_map(|(face, embedding)| {
                let bbox = face.scaled(1.0 / scale).clip(frame.width(), frame.height())?;
                let mut record = FaceRecord::new(bbox);
                record.embedding = embedding;
                Some(record)
            })
            .collect();
        let mut faces = self.fusion.recover_missing_faces(frame, persons, faces, guard);

        if let Some(matcher) = &self.matcher {
            for face in &mut faces {
                if let Some(embedding) = &face.embedding {
                    face.identity = matcher.best_match(embedding);
                }
            }
        }
        self.cached_faces = faces;
        true
    }

    fn hand_off(&self, frame: &Frame, objects: bool, faces: bool) {
        let Some(sink) = &self.detections else {
            return;
        };
        let captured_at_ms = frame
            .captured_wall
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let base = |entity: DetectedEntity, region: BoundingBox, snapshot: Option<Vec<u8>>| SinkRecord {
            session: self.session.to_string(),
            source: self.source.to_string(),
            frame_sequence: frame.sequence,
            captured_at_ms,
            entity,
            region,
            snapshot,
        };

        let mut records = Vec::new();
        if objects {
            for det in &self.cached_objects {
                records.push(base(DetectedEntity::Object(det.clone()), det.bbox, None));
            }
        }
        if faces {
            let pad = self.settings.face_padding_px as f32;
            for face in &self.cached_faces {
                let b = face.bbox.to_bbox();
                let padded = BoundingBox::new(b.x1 - pad, b.y1 - pad, b.x2 + pad, b.y2 + pad);
                let (region, snapshot) = match frame.crop(&padded) {
                    Ok((crop, region)) => (region, encode_jpeg(&crop, JPEG_QUALITY).ok()),
                    Err(_) => (b, None),
                };
                records.push(base(DetectedEntity::Face(face.clone()), region, snapshot));
            }
        }
        if records.is_empty() {
            return;
        }

        let mut sink = match sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        for record in records {
            if let Err(err) = sink.record(record) {
                log::warn!("session {}: detection sink failed: {:#}", self.session, err);
                break;
            }
        }
    }

    /// Overlay the cached detections on a copy of `frame`.
    pub fn annotate(&self, frame: &Frame, processed: bool) -> AnnotatedFrame {
        let mut image = frame.image().clone();
        draw_overlay(&mut image, &self.cached_objects, &self.cached_faces);
        AnnotatedFrame {
            session: self.session.clone(),
            sequence: frame.sequence,
            image,
            objects: self.cached_objects.clone(),
            faces: self.cached_faces.clone(),
            processed,
        }
    }

    fn log_health(&self, handle: &CaptureHandle) {
        log::info!(
            "session {}: source={} healthy={} connected_for={}s read={} processed={} dropped={} read_errors={} engine_errors={}",
            self.session,
            self.source,
            handle.is_healthy(),
            handle.created_at().elapsed().as_secs(),
            self.frames_read,
            self.frames_processed,
            self.frames_dropped,
            self.read_errors,
            self.engine_errors
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{FaceEngine, ObjectDetector, ScriptedFaceEngine, ScriptedObjectDetector};
    use crate::storage::InMemoryDetectionSink;
    use image::RgbImage;

    fn frame(sequence: u64) -> Frame {
        Frame::new(RgbImage::new(640, 480), sequence)
    }

    fn half_scale_person() -> DetectionRecord {
        DetectionRecord::new("person", 0.9, BoundingBox::new(50.0, 50.0, 90.0, 150.0))
    }

    fn pipeline(detector: ScriptedObjectDetector, faces: Option<ScriptedFaceEngine>) -> Pipeline {
        let mut engines = InferenceEngines::new()
            .with_object_detector(Box::new(detector) as Box<dyn ObjectDetector>);
        if let Some(faces) = faces {
            engines = engines.with_face_engine(Box::new(faces) as Box<dyn FaceEngine>);
        }
        Pipeline::new(Arc::new(engines), SessionSettings::default())
    }

    fn worker(pipeline: &Pipeline) -> SessionWorker {
        SessionWorker::new(SessionId::new("s1"), SourceId::new("stub://lobby"), pipeline)
    }

    #[test]
    fn detections_are_mapped_back_to_source_and_stabilized() {
        let outside = DetectionRecord::new("cup", 0.9, BoundingBox::new(400.0, 300.0, 500.0, 400.0));
        let detector = ScriptedObjectDetector::with_fixed(vec![half_scale_person(), outside]);
        let pipeline = pipeline(detector, None);
        let mut worker = worker(&pipeline);

        worker.process(&frame(0));
        assert!(worker.cached_objects().is_empty());
        worker.process(&frame(3));
        assert_eq!(worker.cached_objects().len(), 1);
        assert_eq!(
            worker.cached_objects()[0].bbox,
            BoundingBox::new(100.0, 100.0, 180.0, 300.0)
        );
    }

    #[test]
    fn detector_failure_keeps_cached_overlay() {
        let mut detector = ScriptedObjectDetector::new();
        detector.push_response(vec![half_scale_person()]);
        detector.push_response(vec![half_scale_person()]);
        detector.push_failure("model crashed");
        let pipeline = pipeline(detector, None);
        let mut worker = worker(&pipeline);

        worker.process(&frame(0));
        worker.process(&frame(3));
        assert_eq!(worker.cached_objects().len(), 1);
        worker.process(&frame(6));
        assert_eq!(worker.cached_objects().len(), 1);
        assert_eq!(worker.engine_errors(), 1);

        let annotated = worker.annotate(&frame(7), false);
        assert_eq!(annotated.objects.len(), 1);
        assert!(!annotated.processed);
    }

    #[test]
    fn faces_are_recovered_and_handed_to_the_sink() {
        let detector = ScriptedObjectDetector::with_fixed(vec![half_scale_person()]);
        // Only the narrow head crops contain a findable face.
        let faces = ScriptedFaceEngine::with_locator(|image| {
            if image.width() == 640 {
                return Vec::new();
            }
            let w = image.width() as f32;
            let h = image.height() as f32;
            vec![crate::detect::FaceBox::new(h * 0.2, w * 0.65, h * 0.6, w * 0.35)]
        });
        let store = InMemoryDetectionSink::default();
        let pipeline = pipeline(detector, Some(faces))
            .with_detection_sink(Arc::new(Mutex::new(store.clone())));
        let mut worker = worker(&pipeline);

        worker.process(&frame(0));
        assert_eq!(worker.cached_faces().len(), 1);
        let (cx, cy) = worker.cached_faces()[0].bbox.center();
        assert!(BoundingBox::new(100.0, 100.0, 180.0, 300.0).contains_point(cx, cy));

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].entity, DetectedEntity::Face(_)));
        assert!(records[0].snapshot.is_some());
    }
}
