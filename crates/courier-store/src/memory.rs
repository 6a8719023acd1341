use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use courier_core::{ErrorSeverity, RecordId, Session, SessionRecord};

use crate::error::StoreError;
use crate::store::SessionStore;

/// Non-durable [`SessionStore`] for embedding and tests.
///
/// Records are kept in arrival order. Reads and deletes can be made to fail
/// on demand to exercise the delivery engine's local I/O error path.
#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<BTreeMap<u64, SessionRecord>>,
    next_seq: Mutex<u64>,
    fail_reads: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `list_pending` fail until reset.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `delete` fail until reset.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.records.lock().values().map(|r| r.id.clone()).collect()
    }
}

impl SessionStore for MemorySessionStore {
    fn list_pending(&self) -> Result<Vec<SessionRecord>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Io("simulated read failure".into()));
        }
        Ok(self.records.lock().values().cloned().collect())
    }

    fn delete(&self, ids: &HashSet<RecordId>) -> Result<usize, StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("simulated delete failure".into()));
        }
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| !ids.contains(&record.id));
        Ok(before - records.len())
    }

    fn append(&self, session: &Session) -> Result<RecordId, StoreError> {
        let id = RecordId::new();
        let mut records = self.records.lock();
        let mut seq = self.next_seq.lock();
        *seq += 1;
        records.insert(
            *seq,
            SessionRecord {
                id: id.clone(),
                session: session.clone(),
            },
        );
        Ok(id)
    }

    fn record_error(&self, id: &RecordId, severity: ErrorSeverity) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let record = records
            .values_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("pending session {id}")))?;
        record.session.record_error(severity);
        Ok(())
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.lock().len())
    }
}
