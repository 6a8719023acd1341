use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::TelemetryError;

const METRICS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metric_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        labels TEXT,
        value REAL NOT NULL,
        summary TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_metric_snapshots_name ON metric_snapshots(name, timestamp);";

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "counter" => Some(MetricKind::Counter),
            "gauge" => Some(MetricKind::Gauge),
            "histogram" => Some(MetricKind::Histogram),
            _ => None,
        }
    }
}

/// One persisted row. Histograms store their median in `value` and the full
/// summary as JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub kind: MetricKind,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub summary: Option<HistogramSummary>,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl HistogramSummary {
    fn from_observations(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(f64::total_cmp);
        let n = values.len();
        // Nearest-rank percentile.
        let rank = |q: f64| values[((q * n as f64).ceil() as usize).clamp(1, n) - 1];
        Self {
            count: n as u64,
            sum: values.iter().sum(),
            min: values[0],
            max: values[n - 1],
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    kind: MetricKind,
    name: String,
    labels: BTreeMap<String, String>,
}

impl SeriesKey {
    fn new(kind: MetricKind, name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            kind,
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }
}

enum Series {
    Counter(AtomicU64),
    /// f64 stored as raw bits.
    Gauge(AtomicU64),
    Histogram(Mutex<Vec<f64>>),
}

impl Series {
    fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Series::Counter(AtomicU64::new(0)),
            MetricKind::Gauge => Series::Gauge(AtomicU64::new(0f64.to_bits())),
            MetricKind::Histogram => Series::Histogram(Mutex::new(Vec::new())),
        }
    }
}

/// In-process metric registry with periodic SQLite snapshots.
///
/// Series are identified by kind, name and label set; label order does not
/// matter.
pub struct MetricsRecorder {
    series: RwLock<HashMap<SeriesKey, Series>>,
    db: Mutex<Connection>,
}

impl MetricsRecorder {
    pub fn open(db_path: &Path) -> Result<Self, TelemetryError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, TelemetryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, TelemetryError> {
        conn.execute_batch(METRICS_SCHEMA)?;
        Ok(Self {
            series: RwLock::new(HashMap::new()),
            db: Mutex::new(conn),
        })
    }

    fn with_series(&self, key: SeriesKey, f: impl FnOnce(&Series)) {
        if let Some(series) = self.series.read().get(&key) {
            f(series);
            return;
        }
        let mut all = self.series.write();
        let kind = key.kind;
        f(all.entry(key).or_insert_with(|| Series::empty(kind)));
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.with_series(SeriesKey::new(MetricKind::Counter, name, labels), |s| {
            if let Series::Counter(v) = s {
                v.fetch_add(n, Ordering::Relaxed);
            }
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_series(SeriesKey::new(MetricKind::Gauge, name, labels), |s| {
            if let Series::Gauge(bits) = s {
                bits.store(value.to_bits(), Ordering::Relaxed);
            }
        });
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        self.with_series(SeriesKey::new(MetricKind::Gauge, name, labels), |s| {
            if let Series::Gauge(bits) = s {
                let _ = bits.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    Some((f64::from_bits(current) + delta).to_bits())
                });
            }
        });
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_series(SeriesKey::new(MetricKind::Histogram, name, labels), |s| {
            if let Series::Histogram(values) = s {
                values.lock().push(value);
            }
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = SeriesKey::new(MetricKind::Counter, name, labels);
        match self.series.read().get(&key) {
            Some(Series::Counter(v)) => v.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = SeriesKey::new(MetricKind::Gauge, name, labels);
        match self.series.read().get(&key) {
            Some(Series::Gauge(bits)) => f64::from_bits(bits.load(Ordering::Relaxed)),
            _ => 0.0,
        }
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = SeriesKey::new(MetricKind::Histogram, name, labels);
        match self.series.read().get(&key) {
            Some(Series::Histogram(values)) => {
                HistogramSummary::from_observations(values.lock().clone())
            }
            _ => HistogramSummary::default(),
        }
    }

    /// Persist the current value of every series in one transaction.
    pub fn snapshot(&self) -> Result<usize, TelemetryError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_snapshots (timestamp, name, kind, labels, value, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (key, series) in self.series.read().iter() {
                let (value, summary) = match series {
                    Series::Counter(v) => (v.load(Ordering::Relaxed) as f64, None),
                    Series::Gauge(bits) => (f64::from_bits(bits.load(Ordering::Relaxed)), None),
                    Series::Histogram(values) => {
                        let summary = HistogramSummary::from_observations(values.lock().clone());
                        (summary.p50, serde_json::to_string(&summary).ok())
                    }
                };
                let labels = if key.labels.is_empty() {
                    None
                } else {
                    serde_json::to_string(&key.labels).ok()
                };
                stmt.execute(rusqlite::params![
                    now,
                    key.name,
                    key.kind.as_str(),
                    labels,
                    value,
                    summary
                ])?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricSnapshot>, TelemetryError> {
        let db = self.db.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, name, kind, labels, value, summary FROM metric_snapshots WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();
        if let Some(name) = &q.name {
            params.push(name.clone());
            sql.push_str(&format!(" AND name = ?{}", params.len()));
        }
        if let Some(since) = &q.since {
            params.push(since.clone());
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let kind: String = row.get(3)?;
            let labels: Option<String> = row.get(4)?;
            let summary: Option<String> = row.get(6)?;
            Ok(MetricSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                kind: MetricKind::parse(&kind).unwrap_or(MetricKind::Gauge),
                labels: labels
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or_default(),
                value: row.get(5)?,
                summary: summary.and_then(|raw| serde_json::from_str(&raw).ok()),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete snapshots taken at or before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, TelemetryError> {
        let db = self.db.lock();
        Ok(db.execute(
            "DELETE FROM metric_snapshots WHERE timestamp <= ?1",
            [cutoff.to_rfc3339_opts(SecondsFormat::Millis, true)],
        )?)
    }

    /// Keep only the last `retention_days` of snapshots.
    pub fn prune(&self, retention_days: u32) -> Result<usize, TelemetryError> {
        self.prune_before(Utc::now() - Duration::days(i64::from(retention_days)))
    }
}
