use thiserror::Error;

/// Failure taxonomy of the monitoring core.
///
/// None of these is process-fatal. The worst outcome of any of them is a
/// single session moving to `Closed`.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Capture open or read failure.
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    /// Session open rejected at the concurrency ceiling. Never retried internally.
    #[error("stream capacity exceeded (limit {limit})")]
    CapacityExceeded { limit: usize },

    /// An inference call failed or panicked.
    #[error("detection engine '{engine}' failed: {reason}")]
    DetectionEngine { engine: String, reason: String },

    /// A computed crop or box fell outside the frame after clipping.
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// A second worker tried to drive a session, or a concurrent open
    /// claimed the id first.
    #[error("session {0} is already in use")]
    SessionBusy(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MonitorError {
    pub fn source_unavailable(source_id: impl ToString, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn engine(engine: impl ToString, reason: impl ToString) -> Self {
        Self::DetectionEngine {
            engine: engine.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
