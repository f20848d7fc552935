use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::capture::RetryPolicies;
use crate::fusion::FusionConfig;
use crate::ingest::{CaptureSettings, SourceId};
use crate::session::{SessionId, SessionSettings};
use crate::stabilize::StabilizerConfig;
use crate::storage::DEFAULT_MAX_RECORDS;

const DEFAULT_STREAM_ID: &str = "front";
const DEFAULT_STREAM_SOURCE: &str = "stub://front_camera";
const DEFAULT_CAPTURE_WIDTH: u32 = 1280;
const DEFAULT_CAPTURE_HEIGHT: u32 = 720;
const DEFAULT_CAPTURE_FPS: u32 = 30;
const DEFAULT_MATCH_TOLERANCE: f32 = crate::detect::DEFAULT_MATCH_TOLERANCE;

#[derive(Debug, Deserialize, Default)]
struct MonitordConfigFile {
    streams: Option<Vec<StreamConfigFile>>,
    sessions: Option<SessionSettings>,
    capture: Option<CaptureConfigFile>,
    stabilizer: Option<StabilizerConfig>,
    fusion: Option<FusionConfig>,
    matcher: Option<MatcherConfigFile>,
    storage: Option<StorageConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize)]
struct StreamConfigFile {
    id: String,
    source: String,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    retry: Option<RetryPolicies>,
}

#[derive(Debug, Deserialize, Default)]
struct MatcherConfigFile {
    tolerance: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    db_path: Option<String>,
    max_records: Option<usize>,
    snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    object_model: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

/// One stream monitord opens at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub id: SessionId,
    pub source: SourceId,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// SQLite detection log. `None` disables persistence.
    pub db_path: Option<String>,
    pub max_records: usize,
    /// Directory for per-stream latest-frame JPEG snapshots.
    pub snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// ONNX object model. `None` runs the scripted detector.
    pub object_model: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
}

#[derive(Debug, Clone)]
pub struct MonitordConfig {
    pub streams: Vec<StreamConfig>,
    pub sessions: SessionSettings,
    pub capture: CaptureSettings,
    pub retry: RetryPolicies,
    pub stabilizer: StabilizerConfig,
    pub fusion: FusionConfig,
    pub match_tolerance: f32,
    pub storage: StorageSettings,
    pub detector: DetectorSettings,
}

impl MonitordConfig {
    /// Read `$MONITOR_CONFIG` when set, then apply `MONITOR_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MONITOR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitordConfigFile) -> Result<Self> {
        let streams = match file.streams {
            Some(entries) => entries
                .into_iter()
                .map(|entry| StreamConfig {
                    id: SessionId::new(entry.id.trim()),
                    source: SourceId::new(&entry.source),
                })
                .collect(),
            None => vec![StreamConfig {
                id: SessionId::new(DEFAULT_STREAM_ID),
                source: SourceId::new(DEFAULT_STREAM_SOURCE),
            }],
        };
        let capture_file = file.capture.unwrap_or_default();
        let capture = CaptureSettings {
            width: capture_file.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
            height: capture_file.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
            target_fps: capture_file.target_fps.unwrap_or(DEFAULT_CAPTURE_FPS),
        };
        let storage_file = file.storage.unwrap_or_default();
        let detector_file = file.detector.unwrap_or_default();
        Ok(Self {
            streams,
            sessions: file.sessions.unwrap_or_default(),
            capture,
            retry: capture_file.retry.unwrap_or_default(),
            stabilizer: file.stabilizer.unwrap_or_default(),
            fusion: file.fusion.unwrap_or_default(),
            match_tolerance: file
                .matcher
                .and_then(|matcher| matcher.tolerance)
                .unwrap_or(DEFAULT_MATCH_TOLERANCE),
            storage: StorageSettings {
                db_path: storage_file.db_path,
                max_records: storage_file.max_records.unwrap_or(DEFAULT_MAX_RECORDS),
                snapshot_dir: storage_file.snapshot_dir,
            },
            detector: DetectorSettings {
                object_model: detector_file.object_model,
                input_width: detector_file.input_width.unwrap_or(640),
                input_height: detector_file.input_height.unwrap_or(640),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(sources) = std::env::var("MONITOR_SOURCES") {
            let parsed = parse_sources(&sources)?;
            if !parsed.is_empty() {
                self.streams = parsed;
            }
        }
        if let Ok(max) = std::env::var("MONITOR_MAX_STREAMS") {
            self.sessions.max_streams = max
                .trim()
                .parse()
                .map_err(|_| anyhow!("MONITOR_MAX_STREAMS must be a positive integer"))?;
        }
        if let Ok(every) = std::env::var("MONITOR_DETECT_EVERY") {
            self.sessions.detect_every = every
                .trim()
                .parse()
                .map_err(|_| anyhow!("MONITOR_DETECT_EVERY must be a positive integer"))?;
        }
        if let Ok(path) = std::env::var("MONITOR_DB_PATH") {
            if !path.trim().is_empty() {
                self.storage.db_path = Some(path);
            }
        }
        if let Ok(path) = std::env::var("MONITOR_OBJECT_MODEL") {
            if !path.trim().is_empty() {
                self.detector.object_model = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let sessions = &self.sessions;
        if sessions.max_streams == 0 {
            return Err(anyhow!("sessions.max_streams must be at least 1"));
        }
        if sessions.detect_every == 0 {
            return Err(anyhow!("sessions.detect_every must be at least 1"));
        }
        if !(sessions.detect_scale > 0.0 && sessions.detect_scale <= 1.0) {
            return Err(anyhow!("sessions.detect_scale must be in (0, 1]"));
        }
        check_unit("sessions.object_confidence", sessions.object_confidence)?;
        check_unit("sessions.object_iou", sessions.object_iou)?;

        let stab = &self.stabilizer;
        check_unit("stabilizer.group_iou", stab.group_iou)?;
        check_unit("stabilizer.primary_min_confidence", stab.primary_min_confidence)?;
        check_unit("stabilizer.secondary_min_confidence", stab.secondary_min_confidence)?;
        check_unit("stabilizer.decay_floor", stab.decay_floor)?;
        if !(stab.decay_factor > 0.0 && stab.decay_factor < 1.0) {
            return Err(anyhow!("stabilizer.decay_factor must be in (0, 1)"));
        }
        if stab.primary_history == 0 || stab.secondary_history == 0 {
            return Err(anyhow!("stabilizer history windows must be at least 1 frame"));
        }
        if self.match_tolerance <= 0.0 {
            return Err(anyhow!("matcher.tolerance must be positive"));
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            if stream.id.as_str().is_empty() {
                return Err(anyhow!("stream ids must not be empty"));
            }
            if stream.source.as_str().is_empty() {
                return Err(anyhow!("stream {} has an empty source", stream.id));
            }
            if !seen.insert(stream.id.clone()) {
                return Err(anyhow!("duplicate stream id {}", stream.id));
            }
        }
        if self.streams.len() > sessions.max_streams {
            return Err(anyhow!(
                "{} streams configured but sessions.max_streams is {}",
                self.streams.len(),
                sessions.max_streams
            ));
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(anyhow!("{} must be within [0, 1], got {}", name, value))
    }
}

fn read_config_file(path: &Path) -> Result<MonitordConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

/// Parse `id=source` pairs. A bare source gets a positional id.
///
/// Text before the first `=` is only an id when it holds no `://`, so URLs
/// with query parameters can be given bare.
fn parse_sources(value: &str) -> Result<Vec<StreamConfig>> {
    split_csv(value)
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let (id, source) = match entry.split_once('=') {
                Some((id, source)) if !id.contains("://") => {
                    (id.trim().to_string(), source.trim())
                }
                _ => (format!("stream-{}", index + 1), entry.as_str()),
            };
            if source.is_empty() {
                return Err(anyhow!("MONITOR_SOURCES entry '{}' has no source", entry));
            }
            Ok(StreamConfig {
                id: SessionId::new(id),
                source: SourceId::new(source),
            })
        })
        .collect()
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_accept_ids_and_bare_entries() {
        let parsed = parse_sources("lobby=rtsp://10.0.0.5/live, 0 ,door=stub://door").unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].id.as_str(), "lobby");
        assert_eq!(parsed[0].source.as_str(), "rtsp://10.0.0.5/live");
        assert_eq!(parsed[1].id.as_str(), "stream-2");
        assert_eq!(parsed[1].source.as_str(), "0");
        assert!(parse_sources("cam=").is_err());
    }

    #[test]
    fn bare_urls_keep_their_query_string() {
        let parsed =
            parse_sources("rtsp://cam/s?token=x,gate=rtsp://gate/live?user=a&pass=b").unwrap();
        assert_eq!(parsed[0].id.as_str(), "stream-1");
        assert_eq!(parsed[0].source.as_str(), "rtsp://cam/s?token=x");
        assert_eq!(parsed[1].id.as_str(), "gate");
        assert_eq!(parsed[1].source.as_str(), "rtsp://gate/live?user=a&pass=b");
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = MonitordConfig::from_file(MonitordConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.sessions.max_streams, 4);
        assert_eq!(cfg.streams[0].source.as_str(), DEFAULT_STREAM_SOURCE);
        assert_eq!(cfg.storage.max_records, 10_000);
    }
}
