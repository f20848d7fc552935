pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{ScriptedFaceEngine, ScriptedObjectDetector};

#[cfg(feature = "backend-tract")]
pub use tract::TractObjectDetector;
