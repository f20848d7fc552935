//! Shared capture connections.
//!
//! - `CapturePool`: at most one open connection per `SourceId`, shared by
//!   every session viewing that source and closed when the last one leaves.
//! - `CaptureHandle`: the shared connection. Reads are serialized per handle.
//! - `RetryPolicy`: bounded retry with backoff for opening connections.

mod pool;
mod retry;

use std::sync::{Mutex, MutexGuard};

pub use pool::{CaptureHandle, CapturePool};
pub use retry::{RetryPolicies, RetryPolicy};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Pool and handle state stay consistent across a panicking reader: the
/// counters are only touched under the lock and never left half-updated.
pub(crate) fn lock_recover<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("capture: recovering poisoned lock");
            poisoned.into_inner()
        }
    }
}
