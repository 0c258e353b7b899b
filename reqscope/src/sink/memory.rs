//! In-process capture of records.

use parking_lot::Mutex;

use super::Sink;
use crate::errors::SinkError;
use crate::record::{LogRecord, RecordKind};
use crate::types::CorrelationId;

/// Keeps every record in memory. Used by tests and for introspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every captured record.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Records whose operation key equals `key`.
    pub fn records_with_key(&self, key: &str) -> Vec<LogRecord> {
        self.filter(|r| r.key.as_ref().is_some_and(|k| k.as_str() == key))
    }

    /// Records of one kind.
    pub fn records_of_kind(&self, kind: RecordKind) -> Vec<LogRecord> {
        self.filter(|r| r.kind == kind)
    }

    /// Records belonging to one request.
    pub fn records_for(&self, correlation_id: CorrelationId) -> Vec<LogRecord> {
        self.filter(|r| r.correlation_id == Some(correlation_id))
    }

    fn filter(&self, predicate: impl Fn(&LogRecord) -> bool) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    /// Number of captured records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards every captured record.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
