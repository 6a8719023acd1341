/// SQL DDL for the pending-session database.
/// WAL mode enabled at connection time so the session tracker can append
/// while the delivery worker reads and deletes.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS pending_sessions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    user_json TEXT,
    context_json TEXT NOT NULL,
    handled_count INTEGER NOT NULL DEFAULT 0,
    unhandled_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_sessions_session ON pending_sessions(session_id);

-- Rows that could not be decoded, moved aside so the rest keep shipping.
CREATE TABLE IF NOT EXISTS quarantined_sessions (
    seq INTEGER PRIMARY KEY,
    record_id TEXT,
    session_id TEXT,
    started_at TEXT,
    ended_at TEXT,
    user_json TEXT,
    context_json TEXT,
    handled_count INTEGER,
    unhandled_count INTEGER,
    created_at TEXT,
    reason TEXT NOT NULL,
    quarantined_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
