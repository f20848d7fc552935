use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::bail;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use monitor_kernel::{
    CapturePool, Frame, FrameSource, MonitorError, RetryPolicies, RetryPolicy, SourceConnector,
    SourceId,
};

/// Live connection bookkeeping shared by the connector and its sources.
#[derive(Default)]
struct Counters {
    live: Mutex<HashMap<String, usize>>,
    max_live_per_id: AtomicUsize,
    opens: AtomicUsize,
    attempts: AtomicUsize,
}

impl Counters {
    fn live(&self, id: &str) -> usize {
        self.live.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

/// Ids containing `slow` take `delay` to open; ids containing `bad` never open.
struct CountingConnector {
    counters: Arc<Counters>,
    delay: Duration,
}

struct CountedSource {
    id: String,
    counters: Arc<Counters>,
    sequence: u64,
}

impl SourceConnector for CountingConnector {
    fn connect(&self, id: &SourceId, attempt: u32) -> anyhow::Result<Box<dyn FrameSource>> {
        self.counters.attempts.fetch_add(1, Ordering::SeqCst);
        if id.as_str().contains("slow") {
            thread::sleep(self.delay);
        }
        if id.as_str().contains("bad") {
            bail!("connection refused on attempt {}", attempt);
        }
        let mut live = self.counters.live.lock().unwrap();
        let count = live.entry(id.as_str().to_string()).or_insert(0);
        *count += 1;
        self.counters
            .max_live_per_id
            .fetch_max(*count, Ordering::SeqCst);
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountedSource {
            id: id.as_str().to_string(),
            counters: self.counters.clone(),
            sequence: 0,
        }))
    }
}

impl FrameSource for CountedSource {
    fn read_frame(&mut self) -> anyhow::Result<Frame> {
        self.sequence += 1;
        Ok(Frame::new(RgbImage::new(4, 4), self.sequence))
    }

    fn close(&mut self) {
        let mut live = self.counters.live.lock().unwrap();
        if let Some(count) = live.get_mut(&self.id) {
            *count -= 1;
        }
    }
}

fn pool_with(delay: Duration, retry: RetryPolicy) -> (Arc<CapturePool>, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let connector = CountingConnector {
        counters: counters.clone(),
        delay,
    };
    let pool = CapturePool::new(Arc::new(connector), RetryPolicies::uniform(retry));
    (Arc::new(pool), counters)
}

#[test]
fn two_sessions_share_one_connection() {
    let (pool, counters) = pool_with(Duration::from_millis(20), RetryPolicy::once());
    let id = SourceId::new("stub://cam-1");
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let pool = pool.clone();
            let id = id.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                pool.acquire(&id).unwrap()
            })
        })
        .collect();
    let acquired: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(Arc::ptr_eq(&acquired[0], &acquired[1]));
    assert_eq!(pool.ref_count(&id), 2);
    assert_eq!(counters.opens.load(Ordering::SeqCst), 1);

    pool.release(&id);
    assert_eq!(pool.ref_count(&id), 1);
    assert_eq!(counters.live(id.as_str()), 1);

    pool.release(&id);
    assert_eq!(pool.ref_count(&id), 0);
    assert_eq!(counters.live(id.as_str()), 0);
    assert!(!pool.contains(&id));
}

#[test]
fn concurrent_first_acquires_open_once() {
    let (pool, counters) = pool_with(Duration::from_millis(50), RetryPolicy::once());
    let id = SourceId::new("stub://slow-lobby");
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let id = id.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                pool.acquire(&id).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
    assert_eq!(counters.max_live_per_id.load(Ordering::SeqCst), 1);
    assert_eq!(pool.ref_count(&id), 8);
}

#[test]
fn slow_open_does_not_block_other_sources() {
    let (pool, _counters) = pool_with(Duration::from_millis(400), RetryPolicy::once());
    let slow = SourceId::new("stub://slow-gate");
    let fast = SourceId::new("stub://fast-door");

    let opener = {
        let pool = pool.clone();
        let slow = slow.clone();
        thread::spawn(move || pool.acquire(&slow).map(|_| ()))
    };
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    pool.acquire(&fast).unwrap();
    assert!(started.elapsed() < Duration::from_millis(300));

    opener.join().unwrap().unwrap();
    assert_eq!(pool.ref_count(&slow), 1);
    assert_eq!(pool.ref_count(&fast), 1);
}

#[test]
fn failed_open_retries_then_reports_unavailable() {
    let (pool, counters) = pool_with(
        Duration::ZERO,
        RetryPolicy::fixed(3, Duration::from_millis(1)),
    );
    let id = SourceId::new("rtsp://bad-camera/stream");

    let err = pool.acquire(&id).unwrap_err();
    match err {
        MonitorError::SourceUnavailable { source_id, reason } => {
            assert_eq!(source_id, "rtsp://bad-camera/stream");
            assert!(reason.contains("attempt 3"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(counters.attempts.load(Ordering::SeqCst), 3);
    assert!(!pool.contains(&id));

    // A later release of the failed id changes nothing.
    pool.release(&id);
    assert_eq!(pool.ref_count(&id), 0);
}

#[test]
fn random_acquire_release_sequences_keep_counts_consistent() {
    let (pool, counters) = pool_with(Duration::ZERO, RetryPolicy::once());
    let ids: Vec<SourceId> = ["stub://a", "stub://b", "stub://c"]
        .iter()
        .map(|s| SourceId::new(s))
        .collect();
    let mut model: HashMap<SourceId, usize> = HashMap::new();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..500 {
        let id = &ids[rng.gen_range(0..ids.len())];
        if rng.gen_bool(0.55) {
            pool.acquire(id).unwrap();
            *model.entry(id.clone()).or_default() += 1;
        } else {
            pool.release(id);
            let refs = model.entry(id.clone()).or_default();
            *refs = refs.saturating_sub(1);
        }

        for id in &ids {
            let expected = model.get(id).copied().unwrap_or(0);
            assert_eq!(pool.ref_count(id), expected);
            let live = counters.live(id.as_str());
            assert!(live <= 1);
            assert_eq!(live == 1, expected > 0);
        }
    }
    assert_eq!(counters.max_live_per_id.load(Ordering::SeqCst), 1);
}

#[test]
fn handle_reads_are_serialized_and_cached() {
    let (pool, _counters) = pool_with(Duration::ZERO, RetryPolicy::once());
    let id = SourceId::new("stub://porch");
    let handle = pool.acquire(&id).unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let handle = handle.clone();
            thread::spawn(move || {
                (0..25)
                    .map(|_| handle.read_frame().unwrap().sequence)
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut sequences: Vec<u64> = readers
        .into_iter()
        .flat_map(|r| r.join().unwrap())
        .collect();
    sequences.sort_unstable();
    sequences.dedup();

    // Every read saw a distinct frame.
    assert_eq!(sequences.len(), 100);
    assert_eq!(handle.frames_read(), 100);
    assert_eq!(handle.last_frame().unwrap().sequence, 100);
    pool.release(&id);
}
