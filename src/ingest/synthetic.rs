use anyhow::{anyhow, Result};

use super::{CaptureSettings, FrameSource, SourceId};
use crate::frame::Frame;

/// Synthetic `stub://` source.
///
/// Generates a drifting RGB pattern. Query options shape failure behavior:
/// - `stub://name?offline` refuses to connect
/// - `stub://name?fail_after=N` fails every read after `N` good frames
pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    offline: bool,
    fail_after: Option<u64>,
    frame_count: u64,
    connected: bool,
    /// Simulated scene state, bumped periodically to vary the pattern.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(id: &SourceId, settings: &CaptureSettings) -> Result<Self> {
        let raw = id
            .as_str()
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic sources use the stub:// scheme"))?;
        let (name, query) = raw.split_once('?').unwrap_or((raw, ""));

        let mut offline = false;
        let mut fail_after = None;
        for option in query.split('&').filter(|o| !o.is_empty()) {
            match option.split_once('=') {
                None if option == "offline" => offline = true,
                Some(("fail_after", n)) => {
                    fail_after = Some(
                        n.parse()
                            .map_err(|_| anyhow!("fail_after must be an integer, got '{}'", n))?,
                    );
                }
                _ => return Err(anyhow!("unknown stub option '{}'", option)),
            }
        }

        Ok(Self {
            name: name.to_string(),
            width: settings.width.max(1),
            height: settings.height.max(1),
            offline,
            fail_after,
            frame_count: 0,
            connected: false,
            scene_state: 0,
        })
    }

    /// Synthetic sources connect instantly unless marked offline.
    pub fn connect(&mut self) -> Result<()> {
        if self.offline {
            return Err(anyhow!("stub source {} is offline", self.name));
        }
        self.connected = true;
        log::info!("SyntheticSource: connected to stub://{}", self.name);
        Ok(())
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("stub source {} is not connected", self.name));
        }
        if let Some(limit) = self.fail_after {
            if self.frame_count >= limit {
                return Err(anyhow!("stub source {} stalled", self.name));
            }
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(Frame::from_rgb(
            pixels,
            self.width,
            self.height,
            self.frame_count,
        )?)
    }

    fn is_healthy(&self) -> bool {
        self.connected && self.fail_after.map_or(true, |limit| self.frame_count < limit)
    }

    fn close(&mut self) {
        if self.connected {
            log::info!("SyntheticSource: closed stub://{}", self.name);
        }
        self.connected = false;
    }
}
