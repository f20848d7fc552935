//! monitord - live monitoring daemon
//!
//! This daemon:
//! 1. Loads configuration (`$MONITOR_CONFIG` plus `MONITOR_*` overrides)
//! 2. Builds the guarded inference engines and the shared capture pool
//! 3. Opens one stream session per configured stream, up to the ceiling
//! 4. Writes annotated snapshots and detection records while streaming
//! 5. Closes every session on Ctrl-C and reports per-session summaries

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use monitor_kernel::config::MonitordConfig;
use monitor_kernel::session::SnapshotFrameSink;
use monitor_kernel::{
    AnnotatedFrame, CapturePool, DefaultConnector, Delivery, FrameSink, InferenceEngines,
    Pipeline, ReferenceGallery, ScriptedObjectDetector, SqliteDetectionSink,
    StreamSessionRegistry,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Live multi-camera monitoring daemon")]
struct Args {
    /// JSON config file.
    #[arg(long, env = "MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Write the latest annotated frame of each stream here as `<id>.jpg`.
    #[arg(long, env = "MONITOR_SNAPSHOT_DIR")]
    snapshot_dir: Option<PathBuf>,

    /// Seconds between snapshot writes.
    #[arg(long, default_value_t = 1)]
    snapshot_interval_secs: u64,

    /// Independent object detector instances (each with its own lock).
    #[arg(long, default_value_t = 1)]
    detector_instances: usize,
}

/// Frame sink for streams nobody is watching.
struct Headless;

impl FrameSink for Headless {
    fn deliver(&mut self, _frame: AnnotatedFrame) -> Delivery {
        Delivery::Delivered
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Some(path) = &args.config {
        std::env::set_var("MONITOR_CONFIG", path);
    }
    let cfg = MonitordConfig::load()?;

    let engines = Arc::new(build_engines(&cfg, args.detector_instances.max(1))?);
    let connector = Arc::new(DefaultConnector::new(cfg.capture.clone()));
    let pool = Arc::new(CapturePool::new(connector, cfg.retry.clone()));

    // Reference catalog loading lives outside monitord; faces stay anonymous
    // until a gallery is populated.
    let gallery = ReferenceGallery::new(cfg.match_tolerance);
    let mut pipeline = Pipeline::new(engines, cfg.sessions.clone())
        .with_stabilizer(cfg.stabilizer.clone())
        .with_fusion(cfg.fusion.clone())
        .with_matcher(Arc::new(gallery));
    if let Some(db_path) = &cfg.storage.db_path {
        let sink = SqliteDetectionSink::open(db_path, cfg.storage.max_records)?;
        pipeline = pipeline.with_detection_sink(Arc::new(Mutex::new(sink)));
        log::info!("detections written to {}", db_path);
    }

    let registry = Arc::new(StreamSessionRegistry::new(pool, pipeline));
    let snapshot_dir = args.snapshot_dir.or_else(|| cfg.storage.snapshot_dir.clone());
    if let Some(dir) = &snapshot_dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow!("failed to create snapshot dir {}: {}", dir.display(), e))?;
    }

    let mut workers = Vec::new();
    for stream in &cfg.streams {
        if let Err(e) = registry.open(&stream.source, &stream.id) {
            log::error!("stream {} ({}) not started: {}", stream.id, stream.source, e);
            continue;
        }
        let sink: Box<dyn FrameSink> = match &snapshot_dir {
            Some(dir) => Box::new(SnapshotFrameSink::new(
                dir.join(format!("{}.jpg", stream.id)),
                Duration::from_secs(args.snapshot_interval_secs),
            )),
            None => Box::new(Headless),
        };
        match registry.spawn_session(&stream.id, sink) {
            Ok(worker) => workers.push((stream.id.clone(), worker)),
            Err(e) => log::error!("stream {}: worker not started: {}", stream.id, e),
        }
    }
    log::info!(
        "monitord running: {} of {} stream(s) started, ceiling {}",
        workers.len(),
        cfg.streams.len(),
        registry.max_streams()
    );

    let on_signal = Arc::clone(&registry);
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, closing sessions...");
        on_signal.shutdown();
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    for (id, worker) in workers {
        match worker.join() {
            Ok(summary) => log::info!(
                "stream {}: {:?}, read={} processed={} read_errors={} engine_errors={}",
                id,
                summary.exit,
                summary.frames_read,
                summary.frames_processed,
                summary.read_errors,
                summary.engine_errors
            ),
            Err(_) => log::error!("stream {}: worker panicked", id),
        }
    }
    log::info!(
        "monitord stopped; {} capture connection(s) opened in total",
        registry.pool().connections_opened()
    );
    Ok(())
}

fn build_engines(cfg: &MonitordConfig, instances: usize) -> Result<InferenceEngines> {
    let mut engines = InferenceEngines::new();
    match &cfg.detector.object_model {
        Some(path) => engines.objects = Some(load_object_model(cfg, path, instances)?),
        None => {
            log::warn!("no object model configured; using the scripted detector (no detections)");
            engines = engines.with_object_detector(Box::new(ScriptedObjectDetector::new()));
        }
    }
    log::info!("no face engine configured; face pass disabled");
    Ok(engines)
}

#[cfg(feature = "backend-tract")]
fn load_object_model(
    cfg: &MonitordConfig,
    path: &std::path::Path,
    instances: usize,
) -> Result<monitor_kernel::ObjectDetectorGuard> {
    use monitor_kernel::detect::TractObjectDetector;
    use monitor_kernel::{InferenceGuard, ObjectDetector};

    let detectors = (0..instances)
        .map(|_| {
            TractObjectDetector::new(path, cfg.detector.input_width, cfg.detector.input_height)
                .map(|d| Box::new(d) as Box<dyn ObjectDetector>)
        })
        .collect::<Result<Vec<_>>>()?;
    log::info!(
        "object model {} loaded ({} instance(s))",
        path.display(),
        instances
    );
    Ok(InferenceGuard::with_instances("tract-yolo", detectors)?)
}

#[cfg(not(feature = "backend-tract"))]
fn load_object_model(
    _cfg: &MonitordConfig,
    path: &std::path::Path,
    _instances: usize,
) -> Result<monitor_kernel::ObjectDetectorGuard> {
    Err(anyhow!(
        "object model {} requires the backend-tract feature",
        path.display()
    ))
}
