use anyhow::Result;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::time::{Duration, Instant};

use super::SessionId;
use crate::detect::{DetectionRecord, FaceRecord};
use crate::frame::{encode_jpeg, JPEG_QUALITY};

/// One emitted frame with the overlay that was drawn on it.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub session: SessionId,
    pub sequence: u64,
    pub image: RgbImage,
    pub objects: Vec<DetectionRecord>,
    pub faces: Vec<FaceRecord>,
    /// True when detection ran on this frame rather than reusing the cache.
    pub processed: bool,
}

impl AnnotatedFrame {
    pub fn to_jpeg(&self) -> Result<Vec<u8>> {
        encode_jpeg(&self.image, JPEG_QUALITY)
    }
}

/// Outcome of handing a frame to a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The viewer is behind; this frame was skipped.
    Dropped,
    /// The viewer is gone. The session stops.
    Disconnected,
}

/// Output stream of one session.
pub trait FrameSink: Send {
    fn deliver(&mut self, frame: AnnotatedFrame) -> Delivery;
}

/// Bounded channel to a viewer. Dropping the receiver disconnects.
pub struct ChannelFrameSink {
    tx: SyncSender<AnnotatedFrame>,
}

impl ChannelFrameSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<AnnotatedFrame>) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelFrameSink {
    fn deliver(&mut self, frame: AnnotatedFrame) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Disconnected(_)) => Delivery::Disconnected,
        }
    }
}

/// Writes the latest annotated frame to a JPEG file at most once per period.
pub struct SnapshotFrameSink {
    path: PathBuf,
    period: Duration,
    last_write: Option<Instant>,
}

impl SnapshotFrameSink {
    pub fn new(path: impl AsRef<Path>, period: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            period,
            last_write: None,
        }
    }

    fn write(&self, frame: &AnnotatedFrame) -> Result<()> {
        let jpeg = frame.to_jpeg()?;
        let tmp = self.path.with_extension("jpg.tmp");
        std::fs::write(&tmp, jpeg)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl FrameSink for SnapshotFrameSink {
    fn deliver(&mut self, frame: AnnotatedFrame) -> Delivery {
        if self
            .last_write
            .is_some_and(|at| at.elapsed() < self.period)
        {
            return Delivery::Dropped;
        }
        match self.write(&frame) {
            Ok(()) => {
                self.last_write = Some(Instant::now());
                Delivery::Delivered
            }
            Err(err) => {
                log::warn!(
                    "session {}: snapshot {} failed: {:#}",
                    frame.session,
                    self.path.display(),
                    err
                );
                Delivery::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> AnnotatedFrame {
        AnnotatedFrame {
            session: SessionId::new("s"),
            sequence,
            image: RgbImage::new(8, 8),
            objects: Vec::new(),
            faces: Vec::new(),
            processed: false,
        }
    }

    #[test]
    fn channel_sink_drops_when_full_and_detects_disconnect() {
        let (mut sink, rx) = ChannelFrameSink::bounded(1);
        assert_eq!(sink.deliver(frame(0)), Delivery::Delivered);
        assert_eq!(sink.deliver(frame(1)), Delivery::Dropped);
        assert_eq!(rx.recv().unwrap().sequence, 0);
        drop(rx);
        assert_eq!(sink.deliver(frame(2)), Delivery::Disconnected);
    }

    #[test]
    fn snapshot_sink_rate_limits_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lobby.jpg");
        let mut sink = SnapshotFrameSink::new(&path, Duration::from_secs(60));
        assert_eq!(sink.deliver(frame(0)), Delivery::Delivered);
        assert_eq!(sink.deliver(frame(1)), Delivery::Dropped);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
