use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, instrument, warn};

use courier_core::{ErrorSeverity, RecordId, Session, SessionRecord, SessionUser};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::store::SessionStore;

const TABLE: &str = "pending_sessions";

const SELECT_COLUMNS: &str = "SELECT record_id, session_id, started_at, ended_at, user_json, context_json,
        handled_count, unhandled_count, seq
 FROM pending_sessions";

/// SQLite-backed [`SessionStore`]. Arrival order is the autoincrement `seq`.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Database::open(path).map(Self::new)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Database::in_memory().map(Self::new)
    }

    /// Get one pending record by key.
    #[instrument(skip(self), fields(record_id = %id))]
    pub fn get(&self, id: &RecordId) -> Result<SessionRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE record_id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_record(row),
                None => Err(StoreError::NotFound(format!("pending session {id}"))),
            }
        })
    }

    /// Replace the end time of a pending record (the tracker closes sessions
    /// after they were first persisted).
    #[instrument(skip(self), fields(record_id = %id))]
    pub fn mark_ended(&self, id: &RecordId, ended_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE pending_sessions SET ended_at = ?1 WHERE record_id = ?2",
                rusqlite::params![format_ts(&ended_at), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("pending session {id}")));
            }
            Ok(())
        })
    }

    /// Rows moved out of the pending table because they could not be decoded.
    pub fn quarantined_count(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 =
                conn.query_row("SELECT COUNT(*) FROM quarantined_sessions", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    fn quarantine(&self, corrupt: &[(i64, String)]) -> Result<(), StoreError> {
        let now = format_ts(&Utc::now());
        self.db.with_tx(|tx| {
            let mut copy = tx.prepare(
                "INSERT OR REPLACE INTO quarantined_sessions
                    (seq, record_id, session_id, started_at, ended_at, user_json, context_json,
                     handled_count, unhandled_count, created_at, reason, quarantined_at)
                 SELECT seq, record_id, session_id, started_at, ended_at, user_json, context_json,
                        handled_count, unhandled_count, created_at, ?2, ?3
                 FROM pending_sessions WHERE seq = ?1",
            )?;
            let mut remove = tx.prepare("DELETE FROM pending_sessions WHERE seq = ?1")?;
            for (seq, reason) in corrupt {
                copy.execute(rusqlite::params![seq, reason, now])?;
                remove.execute([seq])?;
            }
            Ok(())
        })
    }
}

impl SessionStore for SqliteSessionStore {
    /// Undecodable rows are skipped and moved to `quarantined_sessions`, so
    /// one bad row never blocks delivery of the others.
    #[instrument(skip(self))]
    fn list_pending(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let (records, corrupt) = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY seq ASC"))?;
            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            let mut corrupt = Vec::new();
            while let Some(row) = rows.next()? {
                match row_to_record(row) {
                    Ok(record) => records.push(record),
                    Err(err @ StoreError::CorruptRow { .. }) => {
                        let seq: i64 = row_helpers::get(row, 8, TABLE, "seq")?;
                        warn!(seq, error = %err, "skipping undecodable pending session");
                        corrupt.push((seq, err.to_string()));
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok((records, corrupt))
        })?;

        if !corrupt.is_empty() {
            match self.quarantine(&corrupt) {
                Ok(()) => warn!(count = corrupt.len(), "quarantined undecodable pending sessions"),
                Err(e) => warn!(error = %e, "failed to quarantine undecodable pending sessions"),
            }
        }
        Ok(records)
    }

    #[instrument(skip(self, ids), fields(requested = ids.len()))]
    fn delete(&self, ids: &HashSet<RecordId>) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.db.with_tx(|tx| {
            let mut stmt = tx.prepare("DELETE FROM pending_sessions WHERE record_id = ?1")?;
            let mut removed = 0;
            for id in ids {
                removed += stmt.execute([id.as_str()])?;
            }
            Ok(removed)
        })?;
        debug!(removed, "deleted pending sessions");
        Ok(removed)
    }

    #[instrument(skip(self, session), fields(session_id = %session.id))]
    fn append(&self, session: &Session) -> Result<RecordId, StoreError> {
        let id = RecordId::new();
        let user_json = session
            .user
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let context_json = serde_json::to_string(&session.context)?;
        let now = format_ts(&Utc::now());

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pending_sessions
                    (record_id, session_id, started_at, ended_at, user_json, context_json,
                     handled_count, unhandled_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id.as_str(),
                    session.id.to_string(),
                    format_ts(&session.started_at),
                    session.ended_at.as_ref().map(format_ts),
                    user_json,
                    context_json,
                    session.handled_count,
                    session.unhandled_count,
                    now,
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    #[instrument(skip(self, id), fields(record_id = %id))]
    fn record_error(&self, id: &RecordId, severity: ErrorSeverity) -> Result<(), StoreError> {
        let sql = match severity {
            ErrorSeverity::Handled => {
                "UPDATE pending_sessions SET handled_count = handled_count + 1 WHERE record_id = ?1"
            }
            ErrorSeverity::Unhandled => {
                "UPDATE pending_sessions SET unhandled_count = unhandled_count + 1 WHERE record_id = ?1"
            }
        };
        self.db.with_conn(|conn| {
            if conn.execute(sql, [id.as_str()])? == 0 {
                return Err(StoreError::NotFound(format!("pending session {id}")));
            }
            Ok(())
        })
    }

    fn count(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM pending_sessions", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    let session_id: String = row_helpers::get(row, 1, TABLE, "session_id")?;
    let started_at: String = row_helpers::get(row, 2, TABLE, "started_at")?;
    let ended_at: Option<String> = row_helpers::get_opt(row, 3, TABLE, "ended_at")?;
    let user_json: Option<String> = row_helpers::get_opt(row, 4, TABLE, "user_json")?;
    let context_json: String = row_helpers::get(row, 5, TABLE, "context_json")?;

    Ok(SessionRecord {
        id: RecordId::from_raw(row_helpers::get::<String>(row, 0, TABLE, "record_id")?),
        session: Session {
            id: row_helpers::parse(&session_id, TABLE, "session_id")?,
            started_at: row_helpers::parse_timestamp(&started_at, TABLE, "started_at")?,
            ended_at: ended_at
                .map(|raw| row_helpers::parse_timestamp(&raw, TABLE, "ended_at"))
                .transpose()?,
            user: user_json
                .map(|raw| row_helpers::parse_json::<SessionUser>(&raw, TABLE, "user_json"))
                .transpose()?,
            context: row_helpers::parse_json(&context_json, TABLE, "context_json")?,
            handled_count: row_helpers::get(row, 6, TABLE, "handled_count")?,
            unhandled_count: row_helpers::get(row, 7, TABLE, "unhandled_count")?,
        },
    })
}
