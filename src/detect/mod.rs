mod backend;
mod backends;
mod geometry;
mod matcher;
mod result;

pub use backend::{FaceEngine, ObjectDetector};
#[cfg(feature = "backend-tract")]
pub use backends::TractObjectDetector;
pub use backends::{ScriptedFaceEngine, ScriptedObjectDetector};
pub use geometry::{non_max_suppression, BoundingBox, FaceBox};
pub use matcher::{IdentityMatcher, ReferenceGallery, DEFAULT_MATCH_TOLERANCE};
pub use result::{DetectionRecord, Embedding, FaceRecord, IdentityMatch, PRIMARY_CLASS};
