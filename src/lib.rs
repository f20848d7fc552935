//! Monitor Kernel
//!
//! Concurrency and resource core of a live multi-camera monitoring pipeline.
//!
//! # Architecture
//!
//! Every viewer stream is a session. Sessions run in parallel and share
//! three kinds of resources:
//!
//! 1. **Capture connections**: one per source, reference counted by the
//!    `CapturePool` and closed when the last session leaves.
//! 2. **Inference engines**: not reentrant, reached only through an
//!    `InferenceGuard` per engine kind.
//! 3. **Stream slots**: the `StreamSessionRegistry` refuses new sessions at
//!    its ceiling instead of queuing them.
//!
//! Per processed frame, raw detections go through `FaceObjectFusion` (faces
//! recovered from person boxes) and the `DetectionStabilizer` (temporal
//! smoothing), and the cached result is drawn on every emitted frame.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (synthetic, RTSP, files, V4L2) and identifiers
//! - `capture`: shared capture pool and retry policy
//! - `inference`: engine guards
//! - `detect`: detection records, engine traits and backends, identity matching
//! - `stabilize`, `fusion`: per-frame post-processing
//! - `session`: registry, worker loop and output sinks
//! - `storage`: detection sinks
//! - `config`: monitord configuration

pub mod annotate;
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod fusion;
pub mod inference;
pub mod ingest;
pub mod session;
pub mod stabilize;
pub mod storage;

pub use capture::{CaptureHandle, CapturePool, RetryPolicies, RetryPolicy};
pub use detect::{
    BoundingBox, DetectionRecord, Embedding, FaceBox, FaceEngine, FaceRecord, IdentityMatch,
    IdentityMatcher, ObjectDetector, ReferenceGallery, ScriptedFaceEngine, ScriptedObjectDetector,
};
pub use error::{MonitorError, Result};
pub use frame::Frame;
pub use fusion::{FaceObjectFusion, FusionConfig};
pub use inference::{FaceEngineGuard, InferenceEngines, InferenceGuard, ObjectDetectorGuard};
pub use ingest::{
    CaptureSettings, DefaultConnector, FrameSource, SourceConnector, SourceId, SourceKind,
};
pub use session::{
    AnnotatedFrame, ChannelFrameSink, Delivery, FrameSink, Pipeline, SessionExit, SessionId,
    SessionSettings, SessionState, SessionSummary, StreamSessionRegistry,
};
pub use stabilize::{DetectionStabilizer, StabilizerConfig};
pub use storage::{DetectionSink, InMemoryDetectionSink, SinkRecord, SqliteDetectionSink};
