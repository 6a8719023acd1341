use std::time::Duration;

use chrono::{DateTime, Utc};

use courier_core::{AttemptId, DeliveryError, SkipReason};

use crate::transport::{Response, TransportError};

/// How one delivery attempt ended.
#[derive(Clone, Debug, PartialEq)]
pub enum AttemptOutcome {
    /// Configuration forbids delivery; the store was not read.
    Skipped(SkipReason),
    /// Nothing was pending; no exchange took place.
    Empty,
    /// The collector confirmed the batch and it was removed locally.
    Accepted { delivered: usize },
    /// The collector refused the batch. Records stay pending.
    Rejected { retained: usize, error: DeliveryError },
    /// The exchange failed in a way worth retrying on the next trigger.
    TransientFailure { retained: usize, error: DeliveryError },
    /// Reading or deleting local records failed.
    StoreFailed(DeliveryError),
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped(_) => "skipped",
            Self::Empty => "empty",
            Self::Accepted { .. } => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::TransientFailure { .. } => "transient_failure",
            Self::StoreFailed(_) => "store_failed",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn error(&self) -> Option<&DeliveryError> {
        match self {
            Self::Rejected { error, .. }
            | Self::TransientFailure { error, .. }
            | Self::StoreFailed(error) => Some(error),
            _ => None,
        }
    }
}

/// Diagnostic record broadcast after every attempt.
#[derive(Clone, Debug)]
pub struct AttemptReport {
    pub attempt_id: AttemptId,
    pub queue: String,
    pub outcome: AttemptOutcome,
    pub batch_size: usize,
    pub code_bundle_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Reduce an exchange result to the accepted status code or the reason it
/// was not accepted.
pub fn classify(result: Result<Response, TransportError>) -> Result<u16, DeliveryError> {
    match result {
        Ok(resp) if (200..300).contains(&resp.status) => Ok(resp.status),
        Ok(resp) => Err(DeliveryError::from_status(
            resp.status,
            String::from_utf8_lossy(&resp.body).into_owned(),
        )),
        Err(err) => Err(err.into()),
    }
}
