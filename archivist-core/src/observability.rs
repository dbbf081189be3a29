/*!
Observability infrastructure for the archive pipeline.

- Structured logging through `tracing`, human readable or JSON
- Prometheus counters and histograms for jobs, archives and uploads
  (behind the `metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::{Duration, Instant};
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{ArchivistError, Result};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "archivist_core=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<ArchivistMetrics>> = OnceLock::new();

/// Metrics collection for archive jobs
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct ArchivistMetrics {
    pub jobs_started_total: Counter,
    pub jobs_cancelled_total: Counter,
    pub archives_built_total: Counter,
    pub archive_failures_total: Counter,
    pub uploads_total: Counter,
    pub upload_errors_total: Counter,

    pub archive_size_bytes: Histogram,
    pub build_seconds: Histogram,
    pub upload_seconds: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| ArchivistError::config(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| ArchivistError::config(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
fn histogram(registry: &Registry, opts: HistogramOpts) -> Result<Histogram> {
    let name = opts.common_opts.name.clone();
    let histogram = Histogram::with_opts(opts)
        .map_err(|e| ArchivistError::config(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| ArchivistError::config(format!("Failed to register {name}: {e}")))?;
    Ok(histogram)
}

#[cfg(feature = "metrics")]
impl ArchivistMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let jobs_started_total = counter(
            &registry,
            "archivist_jobs_started_total",
            "Archive jobs started",
        )?;
        let jobs_cancelled_total = counter(
            &registry,
            "archivist_jobs_cancelled_total",
            "Archive jobs stopped by a user cancel",
        )?;
        let archives_built_total = counter(
            &registry,
            "archivist_archives_built_total",
            "Archives built and verified",
        )?;
        let archive_failures_total = counter(
            &registry,
            "archivist_archive_failures_total",
            "Archives that failed to build, verify or split",
        )?;
        let uploads_total = counter(
            &registry,
            "archivist_uploads_total",
            "Archive parts delivered",
        )?;
        let upload_errors_total = counter(
            &registry,
            "archivist_upload_errors_total",
            "Archive parts that failed to upload",
        )?;

        let archive_size_bytes = histogram(
            &registry,
            HistogramOpts::new("archivist_archive_size_bytes", "Size of verified archives in bytes")
                .buckets(prometheus::exponential_buckets(1024.0, 8.0, 10).unwrap_or_default()),
        )?;
        let build_seconds = histogram(
            &registry,
            HistogramOpts::new(
                "archivist_build_seconds",
                "Time to build and verify one archive",
            ),
        )?;
        let upload_seconds = histogram(
            &registry,
            HistogramOpts::new("archivist_upload_seconds", "Time to upload one part"),
        )?;

        Ok(Self {
            jobs_started_total,
            jobs_cancelled_total,
            archives_built_total,
            archive_failures_total,
            uploads_total,
            upload_errors_total,
            archive_size_bytes,
            build_seconds,
            upload_seconds,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    ///
    /// Returns `None` if the registry could not be set up; the failure is
    /// logged once.
    pub fn global() -> Option<&'static ArchivistMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::error!(error = %e, "metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    pub fn record_job_started(&self) {
        self.jobs_started_total.inc();
    }

    pub fn record_job_cancelled(&self) {
        self.jobs_cancelled_total.inc();
    }

    pub fn record_archive_built(&self, size_bytes: u64, elapsed: Duration) {
        self.archives_built_total.inc();
        self.archive_size_bytes.observe(size_bytes as f64);
        self.build_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn record_archive_failure(&self) {
        self.archive_failures_total.inc();
    }

    pub fn record_upload(&self, elapsed: Duration) {
        self.uploads_total.inc();
        self.upload_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn record_upload_error(&self, elapsed: Duration) {
        self.upload_errors_total.inc();
        self.upload_seconds.observe(elapsed.as_secs_f64());
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| ArchivistError::config(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| ArchivistError::config(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Wall-clock timer for one pipeline step
#[cfg(feature = "metrics")]
pub struct StepTimer {
    start: Instant,
}

#[cfg(feature = "metrics")]
impl StepTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Initialize the global tracing subscriber
///
/// # Arguments
/// * `json` - Emit one JSON object per event instead of human readable lines
///
/// `RUST_LOG` overrides [`DEFAULT_LOG_FILTER`].
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    ArchivistMetrics::global();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };

    result.map_err(|e| {
        ArchivistError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("Archivist observability initialized");
    Ok(())
}
