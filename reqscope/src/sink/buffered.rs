//! Asynchronous buffering in front of any sink.
//!
//! `emit` never blocks: it pushes onto a bounded channel and returns. A
//! background task writes to the inner sink whenever `batch_size` records
//! have accumulated or the flush interval elapses, whichever comes first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::Sink;
use crate::errors::SinkError;
use crate::record::LogRecord;

enum Command {
    Record(Box<LogRecord>),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking front for a slower sink.
pub struct BufferedSink {
    name: String,
    inner: Arc<dyn Sink>,
    sender: mpsc::Sender<Command>,
    capacity: usize,
    failed: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedSink {
    /// Starts the background writer on the current tokio runtime.
    pub fn spawn(
        inner: Arc<dyn Sink>,
        capacity: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Result<Self, SinkError> {
        let name = format!("buffered({})", inner.name());
        let handle = Handle::try_current().map_err(|_| SinkError::NoRuntime(name.clone()))?;

        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let failed = Arc::new(AtomicU64::new(0));
        let worker = handle.spawn(run_worker(
            Arc::clone(&inner),
            receiver,
            batch_size.max(1),
            flush_interval,
            Arc::clone(&failed),
        ));

        tracing::debug!(sink = %name, capacity, batch_size, "Started buffered sink");
        Ok(Self {
            name,
            inner,
            sender,
            capacity,
            failed,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Forces a flush and waits until the inner sink has written it.
    pub async fn drain(&self) -> Result<(), SinkError> {
        let (done, waiter) = oneshot::channel();
        self.sender
            .send(Command::Flush(done))
            .await
            .map_err(|_| SinkError::Closed(self.name.clone()))?;
        waiter
            .await
            .map_err(|_| SinkError::Closed(self.name.clone()))
    }

    /// Stops accepting records, writes what is queued and waits for the
    /// background task to exit.
    pub async fn shutdown(self) {
        let Self { sender, worker, .. } = self;
        drop(sender);
        if let Some(worker) = worker.into_inner() {
            if let Err(error) = worker.await {
                tracing::warn!(error = %error, "Buffered sink worker ended abnormally");
            }
        }
    }

    /// Records the inner sink failed to write.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

async fn run_worker(
    inner: Arc<dyn Sink>,
    mut receiver: mpsc::Receiver<Command>,
    batch_size: usize,
    flush_interval: Duration,
    failed: Arc<AtomicU64>,
) {
    let mut batch: Vec<LogRecord> = Vec::with_capacity(batch_size);
    let mut ticker = time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(Command::Record(record)) => {
                    batch.push(*record);
                    if batch.len() >= batch_size {
                        write_batch(inner.as_ref(), &mut batch, &failed);
                    }
                }
                Some(Command::Flush(done)) => {
                    write_batch(inner.as_ref(), &mut batch, &failed);
                    flush_inner(inner.as_ref());
                    let _ = done.send(());
                }
                None => {
                    write_batch(inner.as_ref(), &mut batch, &failed);
                    flush_inner(inner.as_ref());
                    break;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    write_batch(inner.as_ref(), &mut batch, &failed);
                    flush_inner(inner.as_ref());
                }
            }
        }
    }
}

fn write_batch(inner: &dyn Sink, batch: &mut Vec<LogRecord>, failed: &AtomicU64) {
    for record in batch.drain(..) {
        if let Err(error) = inner.emit(&record) {
            failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(sink = inner.name(), error = %error, "Buffered write failed");
        }
    }
}

fn flush_inner(inner: &dyn Sink) {
    if let Err(error) = inner.flush() {
        tracing::warn!(sink = inner.name(), error = %error, "Buffered flush failed");
    }
}

impl Sink for BufferedSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        self.sender
            .try_send(Command::Record(Box::new(record.clone())))
            .map_err(|e| match e {
                TrySendError::Full(_) => SinkError::BufferFull {
                    capacity: self.capacity,
                },
                TrySendError::Closed(_) => SinkError::Closed(self.name.clone()),
            })
    }

    /// Requests a flush without waiting for it; see [`BufferedSink::drain`].
    fn flush(&self) -> Result<(), SinkError> {
        let (done, _waiter) = oneshot::channel();
        match self.sender.try_send(Command::Flush(done)) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SinkError::Closed(self.name.clone())),
        }
    }

    fn lost(&self) -> u64 {
        self.failed() + self.inner.lost()
    }
}
