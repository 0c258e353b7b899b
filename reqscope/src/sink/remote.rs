//! Generic remote-collector exporter.
//!
//! Records are rendered to JSON, batched, and shipped through a
//! [`CollectorTransport`] on a spawned task, so the caller never waits on
//! the network.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::Sink;
use crate::errors::SinkError;
use crate::record::LogRecord;

/// Delivers batches of rendered records to a collector.
#[async_trait]
pub trait CollectorTransport: Send + Sync + 'static {
    /// Sends one batch. Order within the batch is emission order.
    async fn send(&self, batch: Vec<Value>) -> Result<(), SinkError>;
}

/// Transport that hands batches to a tokio channel.
///
/// Useful as a bridge to any exporter running on its own task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::Sender<Vec<Value>>,
}

impl ChannelTransport {
    /// Creates a transport and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<Value>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl CollectorTransport for ChannelTransport {
    async fn send(&self, batch: Vec<Value>) -> Result<(), SinkError> {
        self.sender
            .send(batch)
            .await
            .map_err(|_| SinkError::Closed("channel transport".to_string()))
    }
}

/// Batching exporter over a [`CollectorTransport`].
///
/// Must be used from within a tokio runtime. Without one, the pending batch
/// is discarded and `emit` reports [`SinkError::NoRuntime`].
pub struct RemoteSink<T: CollectorTransport> {
    name: String,
    transport: Arc<T>,
    batch_size: usize,
    pending: Mutex<Vec<Value>>,
    failed: Arc<AtomicU64>,
}

impl<T: CollectorTransport> RemoteSink<T> {
    /// Creates a sink shipping batches of `batch_size` records.
    pub fn new(name: impl Into<String>, transport: T, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            name: name.into(),
            transport: Arc::new(transport),
            batch_size,
            pending: Mutex::new(Vec::with_capacity(batch_size)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records waiting for the next batch.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Records in batches the transport failed to deliver.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn ship(&self, batch: Vec<Value>) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let size = batch.len();
        let handle = Handle::try_current().map_err(|_| SinkError::NoRuntime(self.name.clone()))?;

        let transport = Arc::clone(&self.transport);
        let failed = Arc::clone(&self.failed);
        let name = self.name.clone();
        handle.spawn(async move {
            if let Err(error) = transport.send(batch).await {
                let lost = failed.fetch_add(size as u64, Ordering::Relaxed) + size as u64;
                tracing::warn!(sink = %name, size, lost, error = %error, "Remote batch delivery failed");
            }
        });
        Ok(())
    }
}

impl<T: CollectorTransport> Sink for RemoteSink<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        let batch = {
            let mut pending = self.pending.lock();
            pending.push(record.to_json());
            if pending.len() < self.batch_size {
                return Ok(());
            }
            std::mem::replace(&mut *pending, Vec::with_capacity(self.batch_size))
        };
        self.ship(batch)
    }

    fn flush(&self) -> Result<(), SinkError> {
        let batch = std::mem::take(&mut *self.pending.lock());
        self.ship(batch)
    }

    fn lost(&self) -> u64 {
        self.failed()
    }
}
