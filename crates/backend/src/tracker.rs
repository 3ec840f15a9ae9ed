//! Per-object failure bookkeeping behind the backend metrics.
//!
//! One lock guards the failure map and the oldest-failure pointer; both are
//! only changed through [`FailureTracker::record_failure`] and
//! [`FailureTracker::record_success`], so the oldest pointer always refers to
//! the live record with the smallest first-failure timestamp.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use tracing::info;

pub const ERRORS_TOTAL: &str = "kubernetes_scanner_backend_errors_total";
pub const RETRIES: &str = "kubernetes_scanner_backend_retries";
pub const OLDEST_FAILURE: &str = "kubernetes_scanner_backend_oldest_failure";
pub const OLDEST_FAILURE_AGE: &str = "kubernetes_scanner_backend_oldest_failure_age_seconds";

pub const RETRY_BUCKETS: [f64; 6] = [1.0, 2.0, 3.0, 5.0, 10.0, 50.0];

pub fn describe_metrics() {
    describe_counter!(ERRORS_TOTAL, "Number of errors sending resources to the backend");
    describe_histogram!(
        RETRIES,
        "Number of retries until resources were upserted successfully, partitioned by their last failure code"
    );
    describe_gauge!(
        OLDEST_FAILURE,
        Unit::Seconds,
        "A timestamp of when the oldest unreconciled resource first failed reconciliation"
    );
    describe_gauge!(
        OLDEST_FAILURE_AGE,
        Unit::Seconds,
        "Age of the first failed reconciliation of the oldest unreconciled resource in seconds"
    );
}

/// Prometheus exporter configured with the retry histogram buckets.
pub fn prometheus_builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(Matcher::Full(RETRIES.to_string()), &RETRY_BUCKETS)
}

/// Unix seconds source, swappable in tests.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    /// Status code of the most recent failure; 0 for transport errors.
    pub code: u16,
    pub retries: u32,
    pub first_failed: i64,
}

/// In-process view of everything exported as metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub errors: BTreeMap<u16, u64>,
    /// Final retry counts observed on success, by last failure code.
    pub retries: BTreeMap<u16, Vec<u32>>,
    pub open_failures: usize,
    pub oldest_failure: Option<i64>,
}

struct Entry {
    record: FailureRecord,
    alias: Option<String>,
}

#[derive(Default)]
struct State {
    failures: HashMap<String, Entry>,
    /// Secondary key of an open record, e.g. the name key of a uid record.
    aliases: HashMap<String, String>,
    oldest: Option<(String, i64)>,
    errors: BTreeMap<u16, u64>,
    retries: BTreeMap<u16, Vec<u32>>,
}

impl State {
    fn resolve(&self, identity: &str) -> String {
        if self.failures.contains_key(identity) {
            return identity.to_string();
        }
        self.aliases.get(identity).cloned().unwrap_or_else(|| identity.to_string())
    }
}

pub struct FailureTracker {
    state: Mutex<State>,
    clock: Clock,
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(|| Utc::now().timestamp()))
    }

    pub fn with_clock(clock: Clock) -> Self {
        gauge!(OLDEST_FAILURE).set(f64::INFINITY);
        Self { state: Mutex::new(State::default()), clock }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_failure(&self, identity: &str, code: u16) {
        self.record_failure_aliased(identity, identity, code);
    }

    /// Record a failure for `identity`. A new record can also be found under
    /// `alias` until it is cleared, so a deletion known only by name settles
    /// the record opened under the object's uid.
    pub fn record_failure_aliased(&self, identity: &str, alias: &str, code: u16) {
        let now = (self.clock)();
        let mut guard = self.lock();
        let st = &mut *guard;

        *st.errors.entry(code).or_insert(0) += 1;
        counter!(ERRORS_TOTAL, "code" => code.to_string()).increment(1);

        let key = st.resolve(identity);
        if let Some(e) = st.failures.get_mut(&key) {
            e.record.retries = e.record.retries.saturating_add(1);
            e.record.code = code;
            return;
        }
        let alias = (alias != key && !st.aliases.contains_key(alias)).then(|| alias.to_string());
        if let Some(a) = &alias {
            st.aliases.insert(a.clone(), key.clone());
        }
        st.failures.insert(key.clone(), Entry { record: FailureRecord { code, retries: 1, first_failed: now }, alias });
        let is_oldest = match &st.oldest {
            None => true,
            Some((_, ts)) => now < *ts,
        };
        if is_oldest {
            gauge!(OLDEST_FAILURE).set(now as f64);
            info!(identity = %key, "set oldest failure");
            st.oldest = Some((key, now));
        }
    }

    /// No-op when the object has no open failure.
    pub fn record_success(&self, identity: &str) {
        let mut guard = self.lock();
        let st = &mut *guard;

        let key = st.resolve(identity);
        let Some(entry) = st.failures.remove(&key) else {
            return;
        };
        if let Some(a) = &entry.alias {
            st.aliases.remove(a);
        }
        let fail = entry.record;
        st.retries.entry(fail.code).or_default().push(fail.retries);
        histogram!(RETRIES, "code" => fail.code.to_string()).record(fail.retries as f64);

        let was_oldest = st.oldest.as_ref().map(|(id, _)| *id == key).unwrap_or(false);
        if !was_oldest {
            return;
        }
        st.oldest = st
            .failures
            .iter()
            .min_by_key(|(_, e)| e.record.first_failed)
            .map(|(id, e)| (id.clone(), e.record.first_failed));
        match &st.oldest {
            None => {
                gauge!(OLDEST_FAILURE).set(f64::INFINITY);
                info!("removed oldest failure, no new ones");
            }
            Some((id, ts)) => {
                gauge!(OLDEST_FAILURE).set(*ts as f64);
                info!(new_oldest_failure = %id, "replaced oldest failure");
            }
        }
    }

    pub fn failure(&self, identity: &str) -> Option<FailureRecord> {
        let st = self.lock();
        st.failures.get(&st.resolve(identity)).map(|e| e.record)
    }

    pub fn oldest_failure(&self) -> Option<i64> {
        self.lock().oldest.as_ref().map(|(_, ts)| *ts)
    }

    /// Seconds since the oldest open failure, or infinity when none is open.
    pub fn oldest_failure_age(&self) -> f64 {
        match self.oldest_failure() {
            Some(ts) => ((self.clock)() - ts) as f64,
            None => f64::INFINITY,
        }
    }

    /// Refresh the age gauge; called right before metrics are scraped.
    pub fn publish_age(&self) {
        gauge!(OLDEST_FAILURE_AGE).set(self.oldest_failure_age());
    }

    pub fn stats(&self) -> FailureStats {
        let st = self.lock();
        FailureStats {
            errors: st.errors.clone(),
            retries: st.retries.clone(),
            open_failures: st.failures.len(),
            oldest_failure: st.oldest.as_ref().map(|(_, ts)| *ts),
        }
    }

    #[cfg(test)]
    fn min_first_failed(&self) -> Option<i64> {
        self.lock().failures.values().map(|e| e.record.first_failed).min()
    }
}
