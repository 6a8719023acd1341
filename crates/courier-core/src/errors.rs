use std::time::Duration;

/// Why a delivery attempt ended without a confirmed acceptance.
/// Classifies failures as permanent (payload or credentials are wrong),
/// transient (try again on the next trigger), or local.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    // Permanent
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // Transient
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("unexpected status {status}")]
    UnexpectedStatus { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,

    // Local
    #[error("store error: {0}")]
    Store(String),
}

impl DeliveryError {
    /// Worth retrying as-is on a later trigger.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::UnexpectedStatus { .. }
                | Self::Network(_)
                | Self::Timeout
        )
    }

    /// The server refused this payload; resending it unchanged will not help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized(_) | Self::Rejected { .. } | Self::InvalidPayload(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Rejected { .. } => "rejected",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::UnexpectedStatus { .. } => "unexpected_status",
            Self::Network(_) => "network_error",
            Self::Timeout => "timeout",
            Self::Store(_) => "store_error",
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            408 => Self::Timeout,
            429 => Self::RateLimited { retry_after: None },
            400..=499 => Self::Rejected { status, body },
            500..=599 => Self::ServerError { status, body },
            _ => Self::UnexpectedStatus { status },
        }
    }
}

/// Why an attempt did not even try to reach the network. Not an error:
/// records stay untouched and nothing is surfaced to the host app.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("session delivery is disabled")]
    Disabled,
    #[error("no API key configured")]
    MissingApiKey,
    #[error("release stage {stage:?} is not enabled for delivery")]
    ReleaseStageFiltered { stage: Option<String> },
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::MissingApiKey => "missing_api_key",
            Self::ReleaseStageFiltered { .. } => "release_stage_filtered",
        }
    }
}
