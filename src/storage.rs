use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::detect::{BoundingBox, DetectionRecord, FaceRecord};

pub const DEFAULT_MAX_RECORDS: usize = 10_000;

/// What a stored record describes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectedEntity {
    Object(DetectionRecord),
    Face(FaceRecord),
}

impl DetectedEntity {
    pub fn label(&self) -> &str {
        match self {
            DetectedEntity::Object(det) => &det.label,
            DetectedEntity::Face(face) => face
                .identity
                .as_ref()
                .map(|m| m.label.as_str())
                .unwrap_or("face"),
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            DetectedEntity::Object(det) => det.confidence,
            DetectedEntity::Face(face) => face.identity.as_ref().map(|m| m.confidence).unwrap_or(0.0),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            DetectedEntity::Object(_) => "object",
            DetectedEntity::Face(_) => "face",
        }
    }
}

/// One finalized detection handed off for persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub session: String,
    pub source: String,
    pub frame_sequence: u64,
    pub captured_at_ms: u64,
    pub entity: DetectedEntity,
    /// Frame region the snapshot was cut from.
    pub region: BoundingBox,
    /// JPEG crop of `region`, when one was taken.
    #[serde(skip)]
    pub snapshot: Option<Vec<u8>>,
}

/// Receiver of finalized detections. Storage layout and retention belong to
/// the implementation.
pub trait DetectionSink: Send {
    fn record(&mut self, record: SinkRecord) -> Result<()>;
}

/// Bounded in-memory sink. Clones share the same buffer.
#[derive(Clone)]
pub struct InMemoryDetectionSink {
    records: Arc<Mutex<VecDeque<SinkRecord>>>,
    capacity: usize,
}

impl InMemoryDetectionSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        match self.records.lock() {
            Ok(records) => records.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryDetectionSink {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}

impl DetectionSink for InMemoryDetectionSink {
    fn record(&mut self, record: SinkRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow!("detection buffer lock poisoned"))?;
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
        Ok(())
    }
}

/// Row read back from `SqliteDetectionSink`.
#[derive(Clone, Debug)]
pub struct StoredDetection {
    pub id: i64,
    pub record: SinkRecord,
    pub has_snapshot: bool,
}

/// SQLite sink keeping the newest `max_records` rows.
pub struct SqliteDetectionSink {
    conn: Connection,
    max_records: usize,
}

impl SqliteDetectionSink {
    pub fn open(db_path: &str, max_records: usize) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut sink = Self {
            conn,
            max_records: max_records.max(1),
        };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              captured_at_ms INTEGER NOT NULL,
              session TEXT NOT NULL,
              source TEXT NOT NULL,
              kind TEXT NOT NULL,
              label TEXT NOT NULL,
              confidence REAL NOT NULL,
              payload_json TEXT NOT NULL,
              snapshot BLOB
            );

            CREATE INDEX IF NOT EXISTS idx_detections_captured ON detections(captured_at_ms);
            CREATE INDEX IF NOT EXISTS idx_detections_label ON detections(label);
            "#,
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Newest records first.
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredDetection>> {
        let limit = i64::try_from(limit).map_err(|_| anyhow!("limit exceeds i64 range"))?;
        let mut stmt = self.conn.prepare(
            "SELECT id, payload_json, snapshot IS NOT NULL FROM detections ORDER BY id DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            let has_snapshot: bool = row.get(2)?;
            let record: SinkRecord = serde_json::from_str(&payload)
                .map_err(|e| anyhow!("corrupt detection row {}: {}", id, e))?;
            out.push(StoredDetection {
                id,
                record,
                has_snapshot,
            });
        }
        Ok(out)
    }

    pub fn snapshot(&self, id: i64) -> Result<Option<Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT snapshot FROM detections WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(None),
        }
    }

    fn enforce_cap(&mut self) -> Result<()> {
        let cap = i64::try_from(self.max_records).map_err(|_| anyhow!("cap exceeds i64 range"))?;
        self.conn.execute(
            "DELETE FROM detections WHERE id NOT IN (SELECT id FROM detections ORDER BY id DESC LIMIT ?1)",
            params![cap],
        )?;
        Ok(())
    }
}

impl DetectionSink for SqliteDetectionSink {
    fn record(&mut self, record: SinkRecord) -> Result<()> {
        let captured_at = i64::try_from(record.captured_at_ms)
            .map_err(|_| anyhow!("capture time exceeds i64 range"))?;
        let payload = serde_json::to_string(&record)?;
        self.conn.execute(
            "INSERT INTO detections (captured_at_ms, session, source, kind, label, confidence, payload_json, snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                captured_at,
                record.session,
                record.source,
                record.entity.kind(),
                record.entity.label(),
                f64::from(record.entity.confidence()),
                payload,
                record.snapshot,
            ],
        )?;
        self.enforce_cap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{FaceBox, IdentityMatch};

    fn object(seq: u64) -> SinkRecord {
        let det = DetectionRecord::new("person", 0.8, BoundingBox::new(1.0, 2.0, 30.0, 60.0));
        SinkRecord {
            session: "s1".to_string(),
            source: "stub://lobby".to_string(),
            frame_sequence: seq,
            captured_at_ms: 1_700_000_000_000 + seq,
            region: det.bbox,
            entity: DetectedEntity::Object(det),
            snapshot: None,
        }
    }

    #[test]
    fn in_memory_sink_keeps_newest() {
        let mut sink = InMemoryDetectionSink::new(2);
        let reader = sink.clone();
        for seq in 0..3 {
            sink.record(object(seq)).unwrap();
        }
        let seqs: Vec<u64> = reader.records().iter().map(|r| r.frame_sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn sqlite_sink_caps_rows_and_reads_back() -> Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        let path = tmp.path().to_string_lossy().to_string();
        let mut sink = SqliteDetectionSink::open(&path, 3)?;
        for seq in 0..5 {
            sink.record(object(seq))?;
        }
        let mut face = FaceRecord::new(FaceBox::new(5.0, 25.0, 30.0, 5.0));
        face.identity = Some(IdentityMatch {
            label: "alice".to_string(),
            confidence: 0.7,
        });
        sink.record(SinkRecord {
            entity: DetectedEntity::Face(face),
            snapshot: Some(vec![0xFF, 0xD8, 0xFF]),
            ..object(5)
        })?;

        assert_eq!(sink.count()?, 3);
        let recent = sink.recent(10)?;
        assert_eq!(recent[0].record.entity.label(), "alice");
        assert!(recent[0].has_snapshot);
        assert_eq!(sink.snapshot(recent[0].id)?, Some(vec![0xFF, 0xD8, 0xFF]));
        assert_eq!(recent[2].record.frame_sequence, 3);
        Ok(())
    }
}
