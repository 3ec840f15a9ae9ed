//! Scanner pipeline: batches events from concurrent reconciliations and
//! ships them through an [`Upload`] implementation.
//!
//! A batch is flushed when it reaches `max_items` or when `max_interval` has
//! passed since its oldest event was added, whichever comes first. Every
//! caller of [`BatchingPipeline::add`] waits for the outcome of the batch its
//! event ended up in.

#![forbid(unsafe_code)]

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, histogram};
use scanner_core::{Batch, EventSink, Upload, UploadError, UpsertEvent};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_items: usize,
    pub max_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_items: 100, max_interval: Duration::from_secs(10) }
    }
}

type Waiter = oneshot::Sender<Result<(), UploadError>>;

#[derive(Default)]
struct Pending {
    events: Vec<UpsertEvent>,
    waiters: Vec<Waiter>,
    oldest: Option<Instant>,
    closed: bool,
}

impl Pending {
    fn take(&mut self) -> Option<(Vec<UpsertEvent>, Vec<Waiter>)> {
        if self.events.is_empty() {
            return None;
        }
        self.oldest = None;
        Some((mem::take(&mut self.events), mem::take(&mut self.waiters)))
    }
}

struct Inner {
    upload: Arc<dyn Upload>,
    cfg: BatchConfig,
    pending: Mutex<Pending>,
    wake: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn flush(&self, events: Vec<UpsertEvent>, waiters: Vec<Waiter>, trigger: &'static str) {
        let batch = Batch::new(events);
        let size = batch.len();
        let request_id = batch.request_id.clone();
        counter!("scanner_pipeline_flushes_total", "trigger" => trigger).increment(1);
        histogram!("scanner_pipeline_batch_size").record(size as f64);
        debug!(request_id = %request_id, size, trigger, "flushing batch");
        let result = self.upload.send(batch).await;
        if let Err(e) = &result {
            warn!(request_id = %request_id, size, error = %e, "batch upload failed");
        }
        for w in waiters {
            let _ = w.send(result.clone());
        }
    }

    /// Take the buffer if its oldest event has waited `max_interval`.
    fn take_due(&self) -> Option<(Vec<UpsertEvent>, Vec<Waiter>)> {
        let mut p = self.lock();
        match p.oldest {
            Some(t) if t + self.cfg.max_interval <= Instant::now() => p.take(),
            _ => None,
        }
    }
}

pub struct BatchingPipeline {
    inner: Arc<Inner>,
    stop: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingPipeline {
    /// Start the pipeline and its interval flusher. Must be called inside a tokio runtime.
    pub fn start(upload: Arc<dyn Upload>, cfg: BatchConfig) -> Self {
        let cfg = BatchConfig { max_items: cfg.max_items.max(1), ..cfg };
        let inner = Arc::new(Inner { upload, cfg, pending: Mutex::new(Pending::default()), wake: Notify::new() });
        let (stop, stop_rx) = watch::channel(false);
        let ticker = tokio::spawn(run_ticker(Arc::clone(&inner), stop_rx));
        info!(max_items = cfg.max_items, max_interval_ms = cfg.max_interval.as_millis() as u64, "batching pipeline started");
        Self { inner, stop, ticker: Mutex::new(Some(ticker)) }
    }

    /// Buffer an event and wait for the upload result of its batch.
    pub async fn add(&self, event: UpsertEvent) -> Result<(), UploadError> {
        let (tx, rx) = oneshot::channel();
        let (full, first) = {
            let mut p = self.inner.lock();
            if p.closed {
                return Err(UploadError::Closed);
            }
            let first = p.events.is_empty();
            if first {
                p.oldest = Some(Instant::now());
            }
            p.events.push(event);
            p.waiters.push(tx);
            let full = if p.events.len() >= self.inner.cfg.max_items { p.take() } else { None };
            (full, first)
        };
        if let Some((events, waiters)) = full {
            self.inner.flush(events, waiters, "size").await;
        } else if first {
            self.inner.wake.notify_one();
        }
        rx.await.unwrap_or(Err(UploadError::Closed))
    }

    /// Number of events waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Stop accepting events, stop the interval flusher and flush whatever is
    /// still buffered.
    pub async fn shutdown(&self) {
        let remaining = {
            let mut p = self.inner.lock();
            p.closed = true;
            p.take()
        };
        let _ = self.stop.send(true);
        let ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = ticker {
            let _ = handle.await;
        }
        if let Some((events, waiters)) = remaining {
            info!(size = events.len(), "flushing buffered events on shutdown");
            self.inner.flush(events, waiters, "shutdown").await;
        }
        info!("batching pipeline stopped");
    }
}

async fn run_ticker(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    loop {
        let deadline = inner.lock().oldest.map(|t| t + inner.cfg.max_interval);
        match deadline {
            Some(at) => tokio::select! {
                _ = tokio::time::sleep_until(at) => {
                    if let Some((events, waiters)) = inner.take_due() {
                        inner.flush(events, waiters, "interval").await;
                    }
                }
                _ = inner.wake.notified() => {}
                _ = stop.changed() => break,
            },
            None => tokio::select! {
                _ = inner.wake.notified() => {}
                _ = stop.changed() => break,
            },
        }
    }
    debug!("interval flusher stopped");
}

#[async_trait::async_trait]
impl EventSink for BatchingPipeline {
    async fn upsert(&self, event: UpsertEvent) -> Result<(), UploadError> {
        self.add(event).await
    }
}
