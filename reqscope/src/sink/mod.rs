//! Pluggable output targets for structured records.
//!
//! A [`Sink`] only transports and formats. The [`SinkSet`] composes sinks,
//! applies the minimum level and absorbs failures, so a broken sink never
//! aborts the operation being logged.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::SinkError;
use crate::record::{LogLevel, LogRecord};

pub mod buffered;
pub mod console;
pub mod file;
pub mod memory;
pub mod remote;

pub use buffered::BufferedSink;
pub use console::ConsoleSink;
pub use file::FileSink;
pub use memory::MemorySink;
pub use remote::{ChannelTransport, CollectorTransport, RemoteSink};

/// An output target for structured records.
pub trait Sink: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &str;

    /// Writes one record.
    fn emit(&self, record: &LogRecord) -> Result<(), SinkError>;

    /// Flushes anything buffered.
    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Records this sink accepted but failed to deliver later, for sinks
    /// that write off the caller's path.
    fn lost(&self) -> u64 {
        0
    }
}

/// Fan-out over any number of sinks.
///
/// Records below the minimum level are skipped. A sink that fails hands the
/// record to the fallback sink; if that also fails, or none is configured,
/// the record is counted as dropped.
pub struct SinkSet {
    sinks: Vec<Arc<dyn Sink>>,
    fallback: Option<Arc<dyn Sink>>,
    min_level: LogLevel,
    dropped: AtomicU64,
}

impl SinkSet {
    /// Creates an empty set delivering records at `min_level` and above.
    pub const fn new(min_level: LogLevel) -> Self {
        Self {
            sinks: Vec::new(),
            fallback: None,
            min_level,
            dropped: AtomicU64::new(0),
        }
    }

    /// Adds a sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Sets the fallback sink
    #[must_use]
    pub fn with_fallback(mut self, sink: Arc<dyn Sink>) -> Self {
        self.fallback = Some(sink);
        self
    }

    /// Registers a sink on an existing set.
    pub fn register(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.push(sink);
    }

    /// Minimum level delivered.
    pub const fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Returns true if records at `level` would be delivered.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Number of sinks registered, not counting the fallback.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns true if no sink is registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Delivers a record to every sink. Never fails.
    pub fn dispatch(&self, record: &LogRecord) {
        if !self.enabled(record.level) {
            return;
        }

        for sink in &self.sinks {
            let Err(error) = sink.emit(record) else {
                continue;
            };

            let rescued = self.fallback.as_ref().is_some_and(|fallback| {
                fallback
                    .emit(record)
                    .inspect_err(|e| {
                        tracing::debug!(sink = fallback.name(), error = %e, "Fallback sink failed");
                    })
                    .is_ok()
            });

            if !rescued {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    sink = sink.name(),
                    error = %error,
                    dropped,
                    "Dropped observability record"
                );
            }
        }
    }

    /// Flushes every sink, including the fallback. Never fails.
    pub fn flush(&self) {
        for sink in self.sinks.iter().chain(self.fallback.iter()) {
            if let Err(error) = sink.flush() {
                tracing::warn!(sink = sink.name(), error = %error, "Sink flush failed");
            }
        }
    }

    /// Records dropped because no sink could take them, plus records a
    /// sink accepted and lost afterwards.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
            + self
                .sinks
                .iter()
                .chain(self.fallback.iter())
                .map(|sink| sink.lost())
                .sum::<u64>()
    }
}

impl Default for SinkSet {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkSet")
            .field(
                "sinks",
                &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("fallback", &self.fallback.as_ref().map(|s| s.name()))
            .field("min_level", &self.min_level)
            .field("dropped", &self.dropped())
            .finish()
    }
}
