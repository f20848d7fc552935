//! Network stream source (RTSP / HTTP).
//!
//! Connections are tuned for live viewing rather than completeness:
//! - zero jitter-buffer latency on RTSP
//! - a single-frame appsink queue that drops stale frames
//! - TCP interleaved transport from the second connection attempt on, for
//!   cameras that lose UDP packets behind NAT

use anyhow::Result;

use super::{AppsinkPolicy, FrameSource};
use crate::frame::Frame;

#[cfg(feature = "capture-gstreamer")]
use super::gst::GstreamerSource;

/// Network stream source.
pub struct RtspSource {
    #[cfg(feature = "capture-gstreamer")]
    inner: GstreamerSource,
    url: String,
}

impl RtspSource {
    #[cfg(feature = "capture-gstreamer")]
    pub fn new(url: &str, target_fps: u32, attempt: u32) -> Result<Self> {
        let description = pipeline_description(url, attempt);
        Ok(Self {
            inner: GstreamerSource::new(url, &description, AppsinkPolicy::LIVE, target_fps)?,
            url: url.to_string(),
        })
    }

    #[cfg(not(feature = "capture-gstreamer"))]
    pub fn new(url: &str, _target_fps: u32, _attempt: u32) -> Result<Self> {
        anyhow::bail!(
            "network stream {} requires the capture-gstreamer feature",
            url
        )
    }

    pub fn url(&self) -> &str {
        &self.url
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

impl FrameSource for RtspSource {
    fn read_frame(&mut self) -> Result<Frame> {
        #[cfg(feature = "capture-gstreamer")]
        {
            self.inner.read_frame()
        }
        #[cfg(not(feature = "capture-gstreamer"))]
        {
            anyhow::bail!("{} has no capture backend", self.url)
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
        log::info!("RtspSource: closed {}", self.url);
    }
}

/// GStreamer launch line for a network URL.
pub fn pipeline_description(url: &str, attempt: u32) -> String {
    let tail = format!(
        "decodebin ! videoconvert ! video/x-raw,format=RGB ! {}",
        AppsinkPolicy::LIVE.launch_element()
    );
    if url.starts_with("rtsp://") {
        let transport = if attempt > 1 { " protocols=tcp" } else { "" };
        format!(
            "rtspsrc location={} latency=0{} ! {}",
            url, transport, tail
        )
    } else {
        format!("souphttpsrc location={} is-live=true ! {}", url, tail)
    }
}
