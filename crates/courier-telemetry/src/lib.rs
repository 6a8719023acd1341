//! Structured logging and metrics for courier.
//!
//! [`init_telemetry`] installs a JSON `tracing` subscriber on stderr plus an
//! optional SQLite sink for warn+ events, and opens the metrics recorder.

mod error;
mod logging;
mod metrics;

pub use error::TelemetryError;
pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{HistogramSummary, MetricKind, MetricSnapshot, MetricsQuery, MetricsRecorder};

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is unset (e.g. `info` or
    /// `info,courier_delivery=debug`).
    pub log_level: String,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    pub log_retention_days: u32,
    pub metrics_enabled: bool,
    pub metrics_db_path: PathBuf,
    pub metrics_retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join(".courier");
        Self {
            log_level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: home.join("logs.db"),
            log_retention_days: 14,
            metrics_enabled: true,
            metrics_db_path: home.join("metrics.db"),
            metrics_retention_days: 7,
        }
    }
}

/// Keeps the telemetry sinks alive. On drop, metrics are snapshotted and
/// both databases are pruned to their retention windows.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics: Option<Arc<MetricsRecorder>>,
    log_retention_days: u32,
    metrics_retention_days: u32,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics.clone()
    }

    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            if let Err(e) = metrics.snapshot() {
                eprintln!("courier-telemetry: metrics snapshot failed: {e}");
            }
            let _ = metrics.prune(self.metrics_retention_days);
        }
        if let Some(sink) = &self.log_sink {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.log_retention_days));
            let _ = sink.prune_before(cutoff);
        }
    }
}

/// Subscriber for work that runs before [`init_telemetry`], such as loading
/// the settings it is configured from. Warnings and errors go to stderr as
/// JSON; use it with `tracing::subscriber::with_default`.
pub fn bootstrap_subscriber() -> impl Subscriber + Send + Sync {
    bootstrap_subscriber_with_writer(std::io::stderr)
}

pub fn bootstrap_subscriber_with_writer<W>(writer: W) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .json()
        .with_max_level(Level::WARN)
        .with_writer(writer)
        .finish()
}

/// Install the global subscriber. Call once at startup; a second call keeps
/// the first subscriber and only opens the sinks.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    let log_sink = if config.log_to_sqlite {
        match SqliteLogSink::open(&config.log_db_path) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                eprintln!("courier-telemetry: failed to open log DB: {e}");
                None
            }
        }
    } else {
        None
    };
    let sqlite_layer = log_sink.clone().map(SqliteLogLayer::new);

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("courier-telemetry: subscriber already installed: {e}");
    }

    let metrics = if config.metrics_enabled {
        match MetricsRecorder::open(&config.metrics_db_path) {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open metrics DB");
                None
            }
        }
    } else {
        None
    };

    TelemetryGuard {
        log_sink,
        metrics,
        log_retention_days: config.log_retention_days,
        metrics_retention_days: config.metrics_retention_days,
    }
}
