//! Scanner backend: upload client for the ingestion API and the failure
//! tracker behind its metrics.

#![forbid(unsafe_code)]

pub mod client;
pub mod tracker;

pub use client::{endpoint_for, EgressSettings, UploadClient, API_VERSION, CONTENT_TYPE_JSON_API, REQUEST_ID_HEADER};
pub use tracker::{
    describe_metrics, prometheus_builder, Clock, FailureRecord, FailureStats, FailureTracker, ERRORS_TOTAL, OLDEST_FAILURE,
    OLDEST_FAILURE_AGE, RETRIES, RETRY_BUCKETS,
};
