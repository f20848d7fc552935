use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use super::lock_recover;
use super::retry::RetryPolicies;
use crate::error::{MonitorError, Result};
use crate::frame::Frame;
use crate::ingest::{FrameSource, SourceConnector, SourceId};

/// One open connection, shared by every session on the same source.
pub struct CaptureHandle {
    id: SourceId,
    source: Mutex<Box<dyn FrameSource>>,
    last_frame: Mutex<Option<Arc<Frame>>>,
    created_at: Instant,
    frames_read: AtomicU64,
    closed: AtomicBool,
}

impl CaptureHandle {
    fn new(id: SourceId, source: Box<dyn FrameSource>) -> Self {
        Self {
            id,
            source: Mutex::new(source),
            last_frame: Mutex::new(None),
            created_at: Instant::now(),
            frames_read: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read the next frame.
    ///
    /// Reads from different sessions sharing this handle are serialized; the
    /// handle lock is released before this returns.
    pub fn read_frame(&self) -> Result<Arc<Frame>> {
        let mut source = lock_recover(&self.source);
        if self.is_closed() {
            return Err(MonitorError::source_unavailable(&self.id, "connection closed"));
        }
        let frame = source
            .read_frame()
            .map_err(|err| MonitorError::source_unavailable(&self.id, format!("{:#}", err)))?;
        let frame = Arc::new(frame);
        self.frames_read.fetch_add(1, Ordering::Relaxed);
        *lock_recover(&self.last_frame) = Some(Arc::clone(&frame));
        Ok(frame)
    }

    /// Most recent frame read by any session on this handle.
    pub fn last_frame(&self) -> Option<Arc<Frame>> {
        lock_recover(&self.last_frame).clone()
    }

    pub fn is_healthy(&self) -> bool {
        !self.is_closed() && lock_recover(&self.source).is_healthy()
    }

    fn close(&self) {
        let mut source = lock_recover(&self.source);
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        source.close();
        lock_recover(&self.last_frame).take();
        log::info!(
            "capture: closed {} after {} frames",
            self.id,
            self.frames_read()
        );
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("id", &self.id)
            .field("frames_read", &self.frames_read())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Per-identifier open slot. Holding its lock while connecting makes
/// concurrent acquirers of the same source wait for one open instead of
/// racing to open their own.
#[derive(Default)]
struct Slot {
    handle: Mutex<Option<Arc<CaptureHandle>>>,
}

struct PoolEntry {
    slot: Arc<Slot>,
    /// Sessions currently holding the handle.
    refs: usize,
    /// Acquirers between "registered" and "got a handle or failed".
    pending: usize,
}

/// Reference-counted registry of open capture connections.
///
/// The pool-wide lock guards only the map and counters. Opening a connection
/// happens under the per-identifier slot lock, so a slow camera never blocks
/// acquires of other sources.
pub struct CapturePool {
    connector: Arc<dyn SourceConnector>,
    retry: RetryPolicies,
    entries: Mutex<HashMap<SourceId, PoolEntry>>,
    opened: AtomicU64,
}

impl CapturePool {
    pub fn new(connector: Arc<dyn SourceConnector>, retry: RetryPolicies) -> Self {
        Self {
            connector,
            retry,
            entries: Mutex::new(HashMap::new()),
            opened: AtomicU64::new(0),
        }
    }

    /// Get the shared handle for `id`, opening a connection if none exists.
    ///
    /// Every successful call must be paired with exactly one `release`.
    pub fn acquire(&self, id: &SourceId) -> Result<Arc<CaptureHandle>> {
        let slot = {
            let mut entries = lock_recover(&self.entries);
            let entry = entries.entry(id.clone()).or_insert_with(|| PoolEntry {
                slot: Arc::new(Slot::default()),
                refs: 0,
                pending: 0,
            });
            entry.pending += 1;
            Arc::clone(&entry.slot)
        };

        let result = self.open_or_share(&slot, id);

        let mut entries = lock_recover(&self.entries);
        let Some(entry) = entries.get_mut(id) else {
            // pending > 0 keeps the entry alive until we get here
            return Err(MonitorError::source_unavailable(id, "pool entry vanished"));
        };
        entry.pending -= 1;
        match result {
            Ok(handle) => {
                entry.refs += 1;
                log::debug!("capture: {} acquired (refs={})", id, entry.refs);
                Ok(handle)
            }
            Err(err) => {
                if entry.refs == 0 && entry.pending == 0 {
                    entries.remove(id);
                }
                Err(err)
            }
        }
    }

    /// Drop one reference to `id`. The connection closes when the count
    /// reaches zero. Releasing an unknown or unreferenced id is a no-op.
    pub fn release(&self, id: &SourceId) {
        let mut entries = lock_recover(&self.entries);
        let Some(entry) = entries.get_mut(id) else {
            log::debug!("capture: release of {} ignored, not in pool", id);
            return;
        };
        if entry.refs == 0 {
            log::debug!("capture: release of {} ignored, no references", id);
            return;
        }
        entry.refs -= 1;
        log::debug!("capture: {} released (refs={})", id, entry.refs);
        if entry.refs > 0 || entry.pending > 0 {
            return;
        }
        if let Some(entry) = entries.remove(id) {
            // No acquirer is in flight, so the slot lock is free. Closing
            // under the pool lock keeps a reopen of the same id from
            // overlapping with this close.
            if let Some(handle) = lock_recover(&entry.slot.handle).take() {
                handle.close();
            }
        }
    }

    /// Current reference count for `id` (0 when absent).
    pub fn ref_count(&self, id: &SourceId) -> usize {
        lock_recover(&self.entries)
            .get(id)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }

    pub fn contains(&self, id: &SourceId) -> bool {
        lock_recover(&self.entries).contains_key(id)
    }

    /// Number of identifiers with at least one holder.
    pub fn open_sources(&self) -> usize {
        lock_recover(&self.entries)
            .values()
            .filter(|entry| entry.refs > 0)
            .count()
    }

    /// Connections opened since the pool was created.
    pub fn connections_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    fn open_or_share(&self, slot: &Slot, id: &SourceId) -> Result<Arc<CaptureHandle>> {
        let mut current = lock_recover(&slot.handle);
        if let Some(handle) = current.as_ref() {
            return Ok(Arc::clone(handle));
        }
        let source = self.connect_with_retry(id)?;
        let handle = Arc::new(CaptureHandle::new(id.clone(), source));
        self.opened.fetch_add(1, Ordering::Relaxed);
        log::info!("capture: opened {}", id);
        *current = Some(Arc::clone(&handle));
        Ok(handle)
    }

    fn connect_with_retry(&self, id: &SourceId) -> Result<Box<dyn FrameSource>> {
        let policy = self.retry.for_kind(id.kind());
        let attempts = policy.attempts();
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.connector.connect(id, attempt) {
                Ok(source) => return Ok(source),
                Err(err) => {
                    log::warn!(
                        "capture: open {} attempt {}/{} failed: {:#}",
                        id,
                        attempt,
                        attempts,
                        err
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        thread::sleep(policy.backoff(attempt));
                    }
                }
            }
        }
        let reason = last_error
            .map(|err| format!("{:#}", err))
            .unwrap_or_else(|| "no connection attempt made".to_string());
        Err(MonitorError::source_unavailable(id, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::RetryPolicy;
    use crate::ingest::{CaptureSettings, DefaultConnector};

    fn pool() -> CapturePool {
        let connector = DefaultConnector::new(CaptureSettings {
            width: 32,
            height: 24,
            target_fps: 30,
        });
        CapturePool::new(Arc::new(connector), RetryPolicies::uniform(RetryPolicy::once()))
    }

    #[test]
    fn second_acquire_shares_the_handle() {
        let pool = pool();
        let id = SourceId::new("stub://cam-1");
        let a = pool.acquire(&id).unwrap();
        let b = pool.acquire(&id).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.ref_count(&id), 2);
        assert_eq!(pool.connections_opened(), 1);

        pool.release(&id);
        assert_eq!(pool.ref_count(&id), 1);
        assert!(!a.is_closed());
        pool.release(&id);
        assert!(!pool.contains(&id));
        assert!(a.is_closed());
        assert!(a.read_frame().is_err());
    }

    #[test]
    fn release_of_unknown_id_is_noop() {
        let pool = pool();
        let id = SourceId::new("stub://never");
        pool.release(&id);
        assert_eq!(pool.ref_count(&id), 0);
        assert!(!pool.contains(&id));
    }

    #[test]
    fn failed_open_leaves_no_entry() {
        let pool = pool();
        let id = SourceId::new("stub://dark?offline");
        let err = pool.acquire(&id).unwrap_err();
        assert!(matches!(err, MonitorError::SourceUnavailable { .. }));
        assert!(!pool.contains(&id));
        assert_eq!(pool.connections_opened(), 0);
    }

    #[test]
    fn reads_update_last_frame() {
        let pool = pool();
        let id = SourceId::new("stub://lobby");
        let handle = pool.acquire(&id).unwrap();
        assert!(handle.last_frame().is_none());
        let frame = handle.read_frame().unwrap();
        let cached = handle.last_frame().unwrap();
        assert_eq!(cached.sequence, frame.sequence);
        assert_eq!(handle.frames_read(), 1);
        pool.release(&id);
    }
}
