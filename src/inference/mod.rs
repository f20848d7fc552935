//! Serialization guards for non-reentrant inference engines.
//!
//! Every call into an engine goes through exactly one `InferenceGuard` for
//! that engine kind. Guards of different kinds are independent, so the object
//! detector and the face engine may run concurrently with each other, never
//! with themselves.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::detect::{FaceEngine, ObjectDetector};
use crate::error::{MonitorError, Result};

/// Exclusive-access wrapper around one or more engine instances.
///
/// With a single instance this is a plain mutex. With several (engines that
/// can safely run as independent copies) calls are spread round-robin, one
/// lock per instance.
pub struct InferenceGuard<E: ?Sized> {
    name: String,
    instances: Vec<Mutex<Box<E>>>,
    next: AtomicUsize,
    calls: AtomicU64,
    failures: AtomicU64,
}

pub type ObjectDetectorGuard = InferenceGuard<dyn ObjectDetector>;
pub type FaceEngineGuard = InferenceGuard<dyn FaceEngine>;

impl<E: ?Sized> InferenceGuard<E> {
    pub fn new(name: impl Into<String>, engine: Box<E>) -> Self {
        Self {
            name: name.into(),
            instances: vec![Mutex::new(engine)],
            next: AtomicUsize::new(0),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Guard over several independent engine instances.
    pub fn with_instances(name: impl Into<String>, engines: Vec<Box<E>>) -> Result<Self> {
        let name = name.into();
        if engines.is_empty() {
            return Err(MonitorError::Config(format!(
                "inference guard '{}' needs at least one engine instance",
                name
            )));
        }
        Ok(Self {
            name,
            instances: engines.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Run `f` with exclusive access to one engine instance.
    ///
    /// The instance lock is released on every exit path. Errors and panics
    /// raised by `f` surface as `MonitorError::DetectionEngine`.
    pub fn with_exclusive<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut E) -> anyhow::Result<T>,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.instances.len();
        let mut engine = self.lock_instance(slot);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut **engine)));
        drop(engine);

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(MonitorError::engine(&self.name, format!("{:#}", err)))
            }
            Err(payload) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(MonitorError::engine(
                    &self.name,
                    format!("engine panicked: {}", panic_message(payload.as_ref())),
                ))
            }
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn lock_instance(&self, slot: usize) -> MutexGuard<'_, Box<E>> {
        match self.instances[slot].lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("InferenceGuard {}: recovering poisoned lock", self.name);
                poisoned.into_inner()
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The set of guarded engines shared by every session worker.
///
/// Either engine may be absent; the corresponding pass is then skipped.
#[derive(Default)]
pub struct InferenceEngines {
    pub objects: Option<ObjectDetectorGuard>,
    pub faces: Option<FaceEngineGuard>,
}

impl InferenceEngines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object_detector(mut self, detector: Box<dyn ObjectDetector>) -> Self {
        let name = detector.name();
        self.objects = Some(InferenceGuard::new(name, detector));
        self
    }

    pub fn with_face_engine(mut self, engine: Box<dyn FaceEngine>) -> Self {
        let name = engine.name();
        self.faces = Some(InferenceGuard::new(name, engine));
        self
    }
}
