//! Local video file source.
//!
//! Decodes a local file in-memory through GStreamer. Remote URLs are
//! rejected here; they belong to the network source.

use anyhow::{anyhow, Result};

use super::{AppsinkPolicy, FrameSource};
use crate::frame::Frame;

#[cfg(feature = "capture-gstreamer")]
use super::gst::GstreamerSource;

/// Local file frame source.
pub struct FileSource {
    #[cfg(feature = "capture-gstreamer")]
    inner: GstreamerSource,
    path: String,
}

impl FileSource {
    pub fn new(path: &str, target_fps: u32) -> Result<Self> {
        if !is_local_file_path(path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        #[cfg(feature = "capture-gstreamer")]
        {
            let description = pipeline_description(path);
            Ok(Self {
                inner: GstreamerSource::new(path, &description, AppsinkPolicy::PLAYBACK, target_fps)?,
                path: path.to_string(),
            })
        }
        #[cfg(not(feature = "capture-gstreamer"))]
        {
            let _ = target_fps;
            Err(anyhow!(
                "file {} requires the capture-gstreamer feature",
                path
            ))
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn connect(&mut self) -> Result<()> {
        #[cfg(feature = "capture-gstreamer")]
        {
            self.inner.connect()
        }
        #[cfg(not(feature = "capture-gstreamer"))]
        {
            Ok(())
        }
    }
}

impl FrameSource for FileSource {
    fn read_frame(&mut self) -> Result<Frame> {
        #[cfg(feature = "capture-gstreamer")]
        {
            self.inner.read_frame()
        }
        #[cfg(not(feature = "capture-gstreamer"))]
        {
            Err(anyhow!("{} has no capture backend", self.path))
        }
    }

    fn is_healthy(&self) -> bool {
        #[cfg(feature = "capture-gstreamer")]
        {
            self.inner.is_healthy()
        }
        #[cfg(not(feature = "capture-gstreamer"))]
        {
            false
        }
    }

    fn close(&mut self) {
        #[cfg(feature = "capture-gstreamer")]
        self.inner.close();
        log::info!("FileSource: closed {}", self.path);
    }
}

/// GStreamer launch line for a local file.
pub fn pipeline_description(path: &str) -> String {
    format!(
        "filesrc location=\"{}\" ! decodebin ! videoconvert ! video/x-raw,format=RGB ! {}",
        path,
        AppsinkPolicy::PLAYBACK.launch_element()
    )
}

fn is_local_file_path(path: &str) -> bool {
    !path.trim().is_empty() && !path.contains("://")
}
