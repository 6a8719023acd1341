use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RecordId, SessionId};

/// User attached to a session, if the host app identified one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl SessionUser {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.email.is_none() && self.name.is_none()
    }
}

/// App and device state captured when the session started.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_build: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

/// Whether an error seen during a session was caught by the app.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Handled,
    Unhandled,
}

/// One app session as recorded by the session tracker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub user: Option<SessionUser>,
    pub context: SessionContext,
    pub handled_count: u32,
    pub unhandled_count: u32,
}

impl Session {
    /// A session starting now with no errors recorded yet.
    pub fn start(context: SessionContext) -> Self {
        Self {
            id: SessionId::new(),
            started_at: Utc::now(),
            ended_at: None,
            user: None,
            context,
            handled_count: 0,
            unhandled_count: 0,
        }
    }

    pub fn with_user(mut self, user: SessionUser) -> Self {
        self.user = (!user.is_empty()).then_some(user);
        self
    }

    pub fn end(&mut self) {
        self.ended_at.get_or_insert_with(Utc::now);
    }

    pub fn record_error(&mut self, severity: ErrorSeverity) {
        match severity {
            ErrorSeverity::Handled => self.handled_count = self.handled_count.saturating_add(1),
            ErrorSeverity::Unhandled => {
                self.unhandled_count = self.unhandled_count.saturating_add(1)
            }
        }
    }
}

/// A session as persisted: the store's stable key plus the session itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: RecordId,
    pub session: Session,
}
