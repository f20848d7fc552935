use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use super::sink::FrameSink;
use super::worker::{SessionSummary, SessionWorker};
use super::{Pipeline, SessionId, SessionState};
use crate::capture::{CaptureHandle, CapturePool};
use crate::error::{MonitorError, Result};
use crate::ingest::SourceId;

/// Registry-side record of one session, shared with its worker.
struct SessionControl {
    id: SessionId,
    source: SourceId,
    /// Guards state transitions and worker attachment together.
    state: Mutex<SessionState>,
    closed: Condvar,
    stop: AtomicBool,
    worker_attached: AtomicBool,
    /// Pool reference held by this session. Taken exactly once on finalize.
    handle: Mutex<Option<Arc<CaptureHandle>>>,
}

impl SessionControl {
    fn new(id: SessionId, source: SourceId) -> Self {
        Self {
            id,
            source,
            state: Mutex::new(SessionState::Starting),
            closed: Condvar::new(),
            stop: AtomicBool::new(false),
            worker_attached: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state != SessionState::Closed {
            *state = next;
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Claim the session for a worker and hand it the capture handle.
    fn attach(&self) -> Result<Arc<CaptureHandle>> {
        let state = lock(&self.state);
        if self.worker_attached.load(Ordering::SeqCst) {
            return Err(MonitorError::SessionBusy(self.id.to_string()));
        }
        if *state != SessionState::Running {
            return Err(MonitorError::UnknownSession(self.id.to_string()));
        }
        let handle = lock(&self.handle)
            .clone()
            .ok_or_else(|| MonitorError::UnknownSession(self.id.to_string()))?;
        self.worker_attached.store(true, Ordering::SeqCst);
        Ok(handle)
    }

    /// Raise the stop flag. Returns true when no worker is attached, in
    /// which case the session is already marked `Closed` and the caller
    /// must finalize it.
    fn request_stop(&self) -> bool {
        let mut state = lock(&self.state);
        self.stop.store(true, Ordering::SeqCst);
        if self.worker_attached.load(Ordering::SeqCst) {
            if *state == SessionState::Running {
                *state = SessionState::Stopping;
            }
            false
        } else {
            *state = SessionState::Closed;
            true
        }
    }

    fn wait_closed(&self) {
        let mut state = lock(&self.state);
        while *state != SessionState::Closed {
            state = match self.closed.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Finalizes a session when its worker returns, panics included.
struct FinalizeOnExit<'a> {
    registry: &'a StreamSessionRegistry,
    control: Arc<SessionControl>,
}

impl Drop for FinalizeOnExit<'_> {
    fn drop(&mut self) {
        self.registry.finalize(&self.control);
    }
}

fn is_live(control: &Arc<SessionControl>) -> bool {
    !control.state().is_closed()
}

/// Owner of all stream sessions.
///
/// Enforces the ceiling on sessions that are not `Closed`, binds each
/// session to a pooled capture handle and returns that reference to the
/// pool on every exit path.
pub struct StreamSessionRegistry {
    pool: Arc<CapturePool>,
    pipeline: Pipeline,
    sessions: Mutex<HashMap<SessionId, Arc<SessionControl>>>,
}

impl StreamSessionRegistry {
    pub fn new(pool: Arc<CapturePool>, pipeline: Pipeline) -> Self {
        Self {
            pool,
            pipeline,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<CapturePool> {
        &self.pool
    }

    pub fn max_streams(&self) -> usize {
        self.pipeline.settings.max_streams
    }

    /// Register session `id` on `source` and acquire its capture handle.
    ///
    /// Fails with `CapacityExceeded`, leaving the registry untouched, when
    /// the ceiling is reached. A failed acquisition moves the session
    /// straight from `Starting` to `Closed`.
    ///
    /// Reopening a live id supersedes the previous session: the new handle
    /// is acquired first, then the old session is stopped and this call
    /// blocks until its worker has exited. If the acquisition fails the old
    /// session keeps running.
    pub fn open(&self, source: &SourceId, id: &SessionId) -> Result<()> {
        let control = {
            let mut sessions = lock(&self.sessions);
            if let Some(old) = sessions.get(id).filter(|s| is_live(s)).cloned() {
                drop(sessions);
                return self.supersede(source, id, old);
            }
            self.check_capacity(&sessions, id, source)?;
            let control = Arc::new(SessionControl::new(id.clone(), source.clone()));
            sessions.insert(id.clone(), Arc::clone(&control));
            control
        };

        match self.pool.acquire(source) {
            Ok(handle) => {
                *lock(&control.handle) = Some(handle);
                if control.stop_requested() {
                    // closed while connecting
                    self.finalize(&control);
                    return Ok(());
                }
                control.set_state(SessionState::Running);
                log::info!("session {}: running on {}", id, source);
                Ok(())
            }
            Err(err) => {
                log::warn!("session {}: {}", id, err);
                self.finalize(&control);
                Err(err)
            }
        }
    }

    fn supersede(&self, source: &SourceId, id: &SessionId, old: Arc<SessionControl>) -> Result<()> {
        // The shared connection stays open across a handover.
        let handle = self.pool.acquire(source).map_err(|err| {
            log::warn!("session {}: reopen on {} failed, keeping the current session: {}", id, source, err);
            err
        })?;
        log::info!("session {}: superseded by a new open on {}", id, source);
        self.stop(&old);
        old.wait_closed();

        let control = Arc::new(SessionControl::new(id.clone(), source.clone()));
        *lock(&control.handle) = Some(handle);
        {
            let mut sessions = lock(&self.sessions);
            let admitted = if sessions.get(id).is_some_and(is_live) {
                Err(MonitorError::SessionBusy(id.to_string()))
            } else {
                self.check_capacity(&sessions, id, source)
            };
            if let Err(err) = admitted {
                drop(sessions);
                self.finalize(&control);
                return Err(err);
            }
            sessions.insert(id.clone(), Arc::clone(&control));
        }
        control.set_state(SessionState::Running);
        log::info!("session {}: running on {}", id, source);
        Ok(())
    }

    fn check_capacity(
        &self,
        sessions: &HashMap<SessionId, Arc<SessionControl>>,
        id: &SessionId,
        source: &SourceId,
    ) -> Result<()> {
        let live = sessions.values().filter(|s| is_live(s)).count();
        let limit = self.max_streams();
        if live >= limit {
            log::warn!("sessions: rejecting {} on {}, {} of {} live", id, source, live, limit);
            return Err(MonitorError::CapacityExceeded { limit });
        }
        Ok(())
    }

    /// Run the processing loop of an opened session on the calling thread.
    ///
    /// Returns once the session ends; by then its pool reference has been
    /// released and it has left the registry.
    pub fn run_session(&self, id: &SessionId, sink: &mut dyn FrameSink) -> Result<SessionSummary> {
        let control = self
            .get(id)
            .ok_or_else(|| MonitorError::UnknownSession(id.to_string()))?;
        let handle = control.attach()?;
        Ok(self.drive(control, &handle, sink))
    }

    /// `run_session` on a dedicated thread.
    ///
    /// The worker is attached before this returns, so a `close` issued right
    /// after it always ends in a `Stopped` summary.
    pub fn spawn_session(
        self: &Arc<Self>,
        id: &SessionId,
        mut sink: Box<dyn FrameSink>,
    ) -> Result<JoinHandle<SessionSummary>> {
        let control = self
            .get(id)
            .ok_or_else(|| MonitorError::UnknownSession(id.to_string()))?;
        let handle = control.attach()?;
        let registry = Arc::clone(self);
        Ok(thread::spawn(move || registry.drive(control, &handle, sink.as_mut())))
    }

    fn drive(
        &self,
        control: Arc<SessionControl>,
        handle: &CaptureHandle,
        sink: &mut dyn FrameSink,
    ) -> SessionSummary {
        let _finalize = FinalizeOnExit {
            registry: self,
            control: Arc::clone(&control),
        };
        let worker = SessionWorker::new(control.id.clone(), control.source.clone(), &self.pipeline);
        let summary = worker.run(handle, &control.stop, sink);
        log::info!(
            "session {}: ended ({:?}) after {} frames",
            control.id,
            summary.exit,
            summary.frames_read
        );
        summary
    }

    /// Ask session `id` to stop. Idempotent; unknown ids are ignored.
    ///
    /// A session with a running worker ends within one loop iteration.
    /// One without a worker is finalized here.
    pub fn close(&self, id: &SessionId) {
        match self.get(id) {
            Some(control) => self.stop(&control),
            None => log::debug!("sessions: close of unknown session {}", id),
        }
    }

    /// Close every session.
    pub fn shutdown(&self) {
        let all: Vec<Arc<SessionControl>> = lock(&self.sessions).values().cloned().collect();
        log::info!("sessions: shutting down {} session(s)", all.len());
        for control in all {
            self.stop(&control);
        }
    }

    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.get(id).map(|control| control.state())
    }

    /// Sessions not yet `Closed`.
    pub fn active_count(&self) -> usize {
        lock(&self.sessions).values().filter(|s| is_live(s)).count()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    fn get(&self, id: &SessionId) -> Option<Arc<SessionControl>> {
        lock(&self.sessions).get(id).cloned()
    }

    fn stop(&self, control: &Arc<SessionControl>) {
        if control.request_stop() {
            self.finalize(control);
        }
    }

    /// Release the pool reference, mark `Closed` and drop the registry
    /// entry if it still belongs to this session. Safe to call repeatedly.
    fn finalize(&self, control: &Arc<SessionControl>) {
        control.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&control.handle).take() {
            self.pool.release(handle.id());
        }
        *lock(&control.state) = SessionState::Closed;
        control.closed.notify_all();

        let mut sessions = lock(&self.sessions);
        if sessions
            .get(&control.id)
            .is_some_and(|current| Arc::ptr_eq(current, control))
        {
            sessions.remove(&control.id);
            log::info!("session {}: closed", control.id);
        }
    }
}

impl Drop for StreamSessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
