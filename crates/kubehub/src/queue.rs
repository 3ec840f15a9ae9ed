//! Deduplicating work queue feeding the reconcile workers.
//!
//! A key is queued at most once. A key that is re-added while a worker holds
//! it is marked dirty and queued again when the worker releases it, so one
//! key is never reconciled concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use scanner_core::ObjectKey;
use tokio::sync::mpsc;

const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

#[derive(Default)]
struct QueueState {
    queued: HashSet<ObjectKey>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
}

pub struct WorkQueue {
    tx: mpsc::UnboundedSender<ObjectKey>,
    state: Mutex<QueueState>,
}

impl WorkQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ObjectKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, state: Mutex::new(QueueState::default()) }, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: ObjectKey) {
        let mut st = self.lock();
        if st.in_flight.contains(&key) {
            st.dirty.insert(key);
            return;
        }
        if st.queued.insert(key.clone()) {
            let _ = self.tx.send(key);
        }
    }

    /// Claim a key received from the channel for processing.
    pub fn start(&self, key: &ObjectKey) {
        let mut st = self.lock();
        st.queued.remove(key);
        st.in_flight.insert(key.clone());
    }

    /// Release a key; re-queues it if it was added while in flight.
    pub fn finish(&self, key: &ObjectKey) {
        let requeue = {
            let mut st = self.lock();
            st.in_flight.remove(key);
            st.dirty.remove(key)
        };
        if requeue {
            self.add(key.clone());
        }
    }

    /// Record a failed attempt and return the delay before the next one.
    pub fn backoff(&self, key: &ObjectKey) -> Duration {
        let mut st = self.lock();
        let n = st.failures.entry(key.clone()).or_insert(0);
        let delay = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(*n)).min(BACKOFF_MAX);
        *n = n.saturating_add(1);
        delay
    }

    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
