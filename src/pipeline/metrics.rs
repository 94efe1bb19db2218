//! Job progress counters and periodic reporting.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters for a materialization job.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Tiles rendered successfully
    pub tiles_rendered: AtomicU64,

    /// Archives handed to the sink successfully
    pub archives_written: AtomicU64,

    /// Bytes handed to the sink successfully
    pub bytes_written: AtomicU64,

    /// Branches abandoned after a render failure
    pub branch_failures: AtomicU64,

    /// Sink writes that failed
    pub sink_failures: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-stage timing (in microseconds for precision)
    /// Time spent resolving sources on the coordinator
    pub resolve_us: AtomicU64,

    /// Time spent rendering, summed across workers
    pub render_us: AtomicU64,

    /// Time spent packaging archives
    pub pack_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_tile_rendered(&self) {
        self.tiles_rendered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an archive write of `bytes`.
    pub fn add_archive_written(&self, bytes: u64) {
        self.archives_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_branch_failure(&self) {
        self.branch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_resolve_time(&self, duration: Duration) {
        self.resolve_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_render_time(&self, duration: Duration) {
        self.render_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_pack_time(&self, duration: Duration) {
        self.pack_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get tiles rendered per second.
    pub fn tiles_per_second(&self) -> f64 {
        let tiles = self.tiles_rendered.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            tiles as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |us: &AtomicU64| us.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            tiles_rendered: self.tiles_rendered.load(Ordering::Relaxed),
            archives_written: self.archives_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            branch_failures: self.branch_failures.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            tiles_per_second: self.tiles_per_second(),
            resolve_secs: secs(&self.resolve_us),
            render_secs: secs(&self.render_us),
            pack_secs: secs(&self.pack_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tiles_rendered: u64,
    pub archives_written: u64,
    pub bytes_written: u64,
    pub branch_failures: u64,
    pub sink_failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub tiles_per_second: f64,
    /// Coordinator time spent resolving sources (seconds)
    pub resolve_secs: f64,
    /// Render time summed across workers (seconds)
    pub render_secs: f64,
    /// Time spent building archives (seconds)
    pub pack_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tiles: {} @ {:.1}/s | Archives: {} ({:.2} MB) | \
             Failures: {} branch, {} sink | Elapsed: {:.1}s | \
             Time: resolve {:.1}s render {:.1}s pack {:.1}s",
            self.tiles_rendered,
            self.tiles_per_second,
            self.archives_written,
            self.bytes_written as f64 / (1024.0 * 1024.0),
            self.branch_failures,
            self.sink_failures,
            self.elapsed.as_secs_f64(),
            self.resolve_secs,
            self.render_secs,
            self.pack_secs,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_branches: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_branches: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_branches,
        }
    }

    /// Report every interval until `shutdown` fires or its sender is dropped.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let done = snapshot.archives_written + snapshot.branch_failures;
                    let progress = if self.total_branches > 0 {
                        done as f64 / self.total_branches as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress.min(100.0), snapshot);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }
}
