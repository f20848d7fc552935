use anyhow::Result;
use image::RgbImage;

use crate::detect::geometry::FaceBox;
use crate::detect::result::{DetectionRecord, Embedding};
use crate::frame::Frame;

/// Object detector engine.
///
/// # Reentrancy
///
/// Implementations are assumed NOT to be safe to call from several threads
/// at once. The core only reaches them through an `InferenceGuard`, which is
/// why `detect` takes `&mut self` and the trait only requires `Send`.
pub trait ObjectDetector: Send {
    /// Engine identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Boxes are in the coordinates of `frame`.
    ///
    /// An empty list is a valid answer.
    fn detect(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<DetectionRecord>>;
}

/// Face locator / encoder engine. Same reentrancy contract as `ObjectDetector`.
pub trait FaceEngine: Send {
    fn name(&self) -> &'static str;

    /// Locate faces. Boxes are in the coordinates of `image`.
    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>>;

    /// Compute one embedding per box, in the same order.
    fn encode(&mut self, image: &RgbImage, boxes: &[FaceBox]) -> Result<Vec<Embedding>>;
}
