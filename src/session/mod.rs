//! Stream sessions: one viewer pipeline per session.
//!
//! - `StreamSessionRegistry`: concurrency ceiling and lifecycle
//!   (`Starting -> Running -> Stopping -> Closed`).
//! - `SessionWorker`: per-session processing cycle (read, detect every Nth
//!   frame, fuse, stabilize, annotate, emit).
//! - `FrameSink`: where annotated frames go.

mod registry;
mod sink;
mod worker;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::detect::IdentityMatcher;
use crate::fusion::FusionConfig;
use crate::inference::InferenceEngines;
use crate::stabilize::StabilizerConfig;
use crate::storage::DetectionSink;

pub use registry::StreamSessionRegistry;
pub use sink::{AnnotatedFrame, ChannelFrameSink, Delivery, FrameSink, SnapshotFrameSink};
pub use worker::{SessionExit, SessionSummary, SessionWorker};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Closed,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

/// Per-session loop parameters.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Ceiling on sessions not yet `Closed`.
    pub max_streams: usize,
    /// Run inference on every Nth frame.
    pub detect_every: u64,
    /// Consecutive read failures tolerated before the session closes.
    pub max_consecutive_errors: u32,
    pub read_retry_delay_ms: u64,
    /// Pause between emitted frames. 0 disables pacing.
    pub frame_interval_ms: u64,
    /// Downscale applied to the frame before the object pass.
    pub detect_scale: f32,
    /// Width the frame is resized to before the face pass.
    pub face_frame_width: u32,
    pub object_confidence: f32,
    pub object_iou: f32,
    /// Padding around face regions handed to the detection sink.
    pub face_padding_px: u32,
    pub health_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_streams: 4,
            detect_every: 3,
            max_consecutive_errors: 30,
            read_retry_delay_ms: 100,
            frame_interval_ms: 30,
            detect_scale: 0.5,
            face_frame_width: 640,
            object_confidence: 0.3,
            object_iou: 0.5,
            face_padding_px: 20,
            health_interval_secs: 5,
        }
    }
}

impl SessionSettings {
    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

/// Everything a session worker needs besides its capture handle.
#[derive(Clone)]
pub struct Pipeline {
    pub engines: Arc<InferenceEngines>,
    pub settings: SessionSettings,
    pub stabilizer: StabilizerConfig,
    pub fusion: FusionConfig,
    pub matcher: Option<Arc<dyn IdentityMatcher>>,
    pub detections: Option<Arc<Mutex<dyn DetectionSink>>>,
}

impl Pipeline {
    pub fn new(engines: Arc<InferenceEngines>, settings: SessionSettings) -> Self {
        Self {
            engines,
            settings,
            stabilizer: StabilizerConfig::default(),
            fusion: FusionConfig::default(),
            matcher: None,
            detections: None,
        }
    }

    pub fn with_stabilizer(mut self, config: StabilizerConfig) -> Self {
        self.stabilizer = config;
        self
    }

    pub fn with_fusion(mut self, config: FusionConfig) -> Self {
        self.fusion = config;
        self
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn IdentityMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn with_detection_sink(mut self, sink: Arc<Mutex<dyn DetectionSink>>) -> Self {
        self.detections = Some(sink);
        self
    }
}
