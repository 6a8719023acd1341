//! Shared types for the courier session delivery workspace: identifiers,
//! the session data model, delivery configuration and the error taxonomy.

pub mod config;
pub mod errors;
pub mod ids;
pub mod session;

pub use config::{ApiKey, AppInfo, CodeBundleId, DeliveryConfig, DeviceInfo, NotifierInfo};
pub use errors::{DeliveryError, SkipReason};
pub use ids::{AttemptId, RecordId, SessionId};
pub use session::{ErrorSeverity, Session, SessionContext, SessionRecord, SessionUser};
