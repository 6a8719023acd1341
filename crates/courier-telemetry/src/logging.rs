use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::error::TelemetryError;

const LOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        attempt_id TEXT,
        queue TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
    CREATE INDEX IF NOT EXISTS idx_logs_attempt ON logs(attempt_id);
    CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);";

/// A persisted log event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub attempt_id: Option<String>,
    pub queue: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Exact level, upper case (`WARN`, `ERROR`).
    pub level: Option<String>,
    /// Substring match on the event target.
    pub target: Option<String>,
    pub attempt_id: Option<String>,
    /// RFC 3339 lower bound (inclusive).
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite table of log events, newest first on query.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
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
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // Errors are dropped: a failing log sink must not take down the caller.
    fn insert(&self, entry: &PendingLog) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, attempt_id, queue)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.timestamp,
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.attempt_id,
                entry.queue,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, TelemetryError> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, attempt_id, queue
             FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            params.push(Box::new(level.to_uppercase()));
            sql.push_str(&format!(" AND level = ?{}", params.len()));
        }
        if let Some(target) = &q.target {
            params.push(Box::new(format!("%{target}%")));
            sql.push_str(&format!(" AND target LIKE ?{}", params.len()));
        }
        if let Some(attempt_id) = &q.attempt_id {
            params.push(Box::new(attempt_id.clone()));
            sql.push_str(&format!(" AND attempt_id = ?{}", params.len()));
        }
        if let Some(since) = &q.since {
            params.push(Box::new(since.clone()));
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                attempt_id: row.get(6)?,
                queue: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> Result<i64, TelemetryError> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?)
    }

    /// Delete events logged before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, TelemetryError> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM logs WHERE timestamp < ?1",
            [cutoff.to_rfc3339_opts(SecondsFormat::Millis, true)],
        )?)
    }
}

struct PendingLog {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    attempt_id: Option<String>,
    queue: Option<String>,
}

/// `tracing` layer persisting events at or above `min_level` (warn by
/// default). `attempt_id` and `queue` come from the event itself or the
/// nearest enclosing span that carries them.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
    min_level: Level,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self {
            sink,
            min_level: Level::WARN,
        }
    }

    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }
}

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    attempt_id: Option<String>,
    queue: Option<String>,
}

impl EventFields {
    fn put(&mut self, field: &Field, value: serde_json::Value) {
        let _ = self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "attempt_id" => self.attempt_id = Some(value.to_string()),
            "queue" => self.queue = Some(value.to_string()),
            _ => self.put(field, value.into()),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        let trimmed = rendered.trim_matches('"').to_string();
        match field.name() {
            "message" => self.message = Some(rendered),
            "attempt_id" => self.attempt_id = Some(trimmed),
            "queue" => self.queue = Some(trimmed),
            _ => self.put(field, rendered.into()),
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

/// Span extension carrying attempt context down to child events.
#[derive(Clone, Default)]
struct AttemptScope {
    attempt_id: Option<String>,
    queue: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = EventFields::default();
        attrs.record(&mut visitor);
        if visitor.attempt_id.is_none() && visitor.queue.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(AttemptScope {
                attempt_id: visitor.attempt_id,
                queue: visitor.queue,
            });
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut visitor = EventFields::default();
        values.record(&mut visitor);
        if visitor.attempt_id.is_none() && visitor.queue.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut extensions = span.extensions_mut();
            let mut scope = extensions.remove::<AttemptScope>().unwrap_or_default();
            if visitor.attempt_id.is_some() {
                scope.attempt_id = visitor.attempt_id;
            }
            if visitor.queue.is_some() {
                scope.queue = visitor.queue;
            }
            extensions.insert(scope);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > self.min_level {
            return;
        }

        let mut visitor = EventFields::default();
        event.record(&mut visitor);

        if visitor.attempt_id.is_none() || visitor.queue.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    let Some(found) = extensions.get::<AttemptScope>() else {
                        continue;
                    };
                    if visitor.attempt_id.is_none() {
                        visitor.attempt_id.clone_from(&found.attempt_id);
                    }
                    if visitor.queue.is_none() {
                        visitor.queue.clone_from(&found.queue);
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&PendingLog {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            attempt_id: visitor.attempt_id,
            queue: visitor.queue,
        });
    }
}
