//! Frame ingestion sources.
//!
//! This module provides the sources a capture handle can own:
//! - Local camera devices by index (feature: capture-v4l2)
//! - RTSP / HTTP network streams (feature: capture-gstreamer)
//! - Local video files (feature: capture-gstreamer)
//! - Synthetic `stub://` sources (always available, used for tests and dry runs)
//!
//! Sources are opened by a `SourceConnector`. The capture pool owns the
//! resulting `FrameSource` and is the only caller of `read_frame`.

pub mod file;
#[cfg(feature = "capture-gstreamer")]
mod gst;
#[cfg(feature = "capture-v4l2")]
mod normalize;
pub mod rtsp;
mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::frame::Frame;

pub use file::FileSource;
pub use rtsp::RtspSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Source;

/// Opaque key identifying a physical video source.
///
/// Device indices (`"0"`), stream URLs (`rtsp://…`), file paths and
/// synthetic `stub://` names are all accepted. Equality is textual after
/// trimming.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

/// Source family. Selects the connection backend and the retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    LocalDevice,
    Network,
    File,
    Synthetic,
}

impl SourceId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> SourceKind {
        let raw = self.0.as_str();
        if raw.starts_with("stub://") {
            SourceKind::Synthetic
        } else if raw.starts_with("rtsp://")
            || raw.starts_with("http://")
            || raw.starts_with("https://")
        {
            SourceKind::Network
        } else if self.device_index().is_some() {
            SourceKind::LocalDevice
        } else {
            SourceKind::File
        }
    }

    /// Local device index, for purely numeric identifiers.
    pub fn device_index(&self) -> Option<u32> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.0.parse().ok()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl FromStr for SourceId {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let id = Self::new(raw);
        if id.0.is_empty() {
            return Err(anyhow!("source identifier must not be empty"));
        }
        Ok(id)
    }
}

/// An open connection yielding frames on demand.
///
/// An `Err` from `read_frame` is a transient read failure; the caller decides
/// how many consecutive failures it tolerates.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool {
        true
    }

    /// Close the underlying connection. Called once, when the last reference
    /// to the owning capture handle is released.
    fn close(&mut self) {}
}

/// Opens connections for the capture pool.
pub trait SourceConnector: Send + Sync {
    /// Open `id`. `attempt` starts at 1 and grows with each retry, so
    /// backends can vary their strategy between attempts.
    fn connect(&self, id: &SourceId, attempt: u32) -> Result<Box<dyn FrameSource>>;
}

/// Queueing behavior of the appsink at the end of a GStreamer pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AppsinkPolicy {
    /// Pace delivery on the pipeline clock.
    pub sync: bool,
    /// Replace the queued frame instead of blocking upstream.
    pub drop: bool,
}

impl AppsinkPolicy {
    /// Live streams: newest frame wins, no pacing.
    pub(crate) const LIVE: Self = Self {
        sync: false,
        drop: true,
    };
    /// File playback: every frame, at the file's own rate.
    pub(crate) const PLAYBACK: Self = Self {
        sync: true,
        drop: false,
    };

    pub(crate) fn launch_element(&self) -> String {
        format!(
            "appsink name=appsink sync={} max-buffers=1 drop={}",
            self.sync, self.drop
        )
    }
}

/// Capture parameters applied when opening a connection.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Preferred width for local devices and synthetic sources.
    pub width: u32,
    /// Preferred height for local devices and synthetic sources.
    pub height: u32,
    /// Target frame rate (frames per second).
    pub target_fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            target_fps: 30,
        }
    }
}

/// Connector dispatching on `SourceKind` to the compiled-in backends.
#[derive(Clone, Debug, Default)]
pub struct DefaultConnector {
    settings: CaptureSettings,
}

impl DefaultConnector {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }
}

impl SourceConnector for DefaultConnector {
    fn connect(&self, id: &SourceId, attempt: u32) -> Result<Box<dyn FrameSource>> {
        match id.kind() {
            SourceKind::Synthetic => {
                let mut source = SyntheticSource::new(id, &self.settings)?;
                source.connect()?;
                Ok(Box::new(source))
            }
            SourceKind::Network => {
                let mut source = RtspSource::new(id.as_str(), self.settings.target_fps, attempt)?;
                source.connect()?;
                Ok(Box::new(source))
            }
            SourceKind::File => {
                let mut source = FileSource::new(id.as_str(), self.settings.target_fps)?;
                source.connect()?;
                Ok(Box::new(source))
            }
            SourceKind::LocalDevice => open_local_device(id, &self.settings),
        }
    }
}

#[cfg(feature = "capture-v4l2")]
fn open_local_device(id: &SourceId, settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    let index = id
        .device_index()
        .ok_or_else(|| anyhow!("'{}' is not a device index", id))?;
    let config = v4l2::V4l2Config {
        device: format!("/dev/video{}", index),
        target_fps: settings.target_fps,
        width: settings.width,
        height: settings.height,
    };
    let mut source = V4l2Source::new(config)?;
    source.connect()?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "capture-v4l2"))]
fn open_local_device(id: &SourceId, _settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "local device {} requires the capture-v4l2 feature",
        id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kinds_are_inferred() {
        assert_eq!(SourceId::new("0").kind(), SourceKind::LocalDevice);
        assert_eq!(SourceId::new(" 12 ").device_index(), Some(12));
        assert_eq!(
            SourceId::new("rtsp://10.0.0.2:554/stream").kind(),
            SourceKind::Network
        );
        assert_eq!(SourceId::new("https://cam/mjpeg").kind(), SourceKind::Network);
        assert_eq!(SourceId::new("stub://front").kind(), SourceKind::Synthetic);
        assert_eq!(SourceId::new("/var/video/lobby.mp4").kind(), SourceKind::File);
        assert!("   ".parse::<SourceId>().is_err());
    }

    #[test]
    fn default_connector_opens_synthetic_sources() -> Result<()> {
        let connector = DefaultConnector::new(CaptureSettings {
            width: 64,
            height: 48,
            target_fps: 10,
        });
        let mut source = connector.connect(&SourceId::new("stub://lobby"), 1)?;
        let frame = source.read_frame()?;
        assert_eq!((frame.width(), frame.height()), (64, 48));
        Ok(())
    }
}
