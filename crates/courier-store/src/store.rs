use std::collections::HashSet;

use courier_core::{ErrorSeverity, RecordId, Session, SessionRecord};

use crate::error::StoreError;

/// Durable storage of sessions waiting for delivery.
///
/// Implementations must tolerate `append` and `record_error` from any thread
/// while the delivery worker runs `list_pending` followed by `delete`.
pub trait SessionStore: Send + Sync {
    /// Every pending record, oldest first.
    fn list_pending(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Delete exactly the given records. Ids that are already gone are
    /// ignored. Returns how many records were removed.
    fn delete(&self, ids: &HashSet<RecordId>) -> Result<usize, StoreError>;

    /// Persist a session and return the key it is stored under.
    fn append(&self, session: &Session) -> Result<RecordId, StoreError>;

    /// Bump the handled/unhandled counter of a pending record.
    fn record_error(&self, id: &RecordId, severity: ErrorSeverity) -> Result<(), StoreError>;

    fn count(&self) -> Result<usize, StoreError>;
}
