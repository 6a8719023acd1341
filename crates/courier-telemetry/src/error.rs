#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("telemetry database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("telemetry IO error: {0}")]
    Io(#[from] std::io::Error),
}
