//! HTTP upload of batches to the ingestion endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use scanner_core::{Batch, Upload, UploadError};
use serde::Serialize;
use tracing::{debug, error};

use crate::tracker::FailureTracker;

pub const CONTENT_TYPE_JSON_API: &str = "application/vnd.api+json";
pub const REQUEST_ID_HEADER: &str = "snyk-request-id";
pub const API_VERSION: &str = "2023-02-20~experimental";
const RESOURCE_TYPE: &str = "kubernetes_resource";

/// Where and how to reach the backend.
#[derive(Debug, Clone)]
pub struct EgressSettings {
    pub base_url: String,
    pub organization_id: String,
    pub token: String,
    pub timeout: Duration,
}

pub fn endpoint_for(base_url: &str, organization_id: &str) -> String {
    format!(
        "{}/hidden/orgs/{}/kubernetes_resources?version={}",
        base_url.trim_end_matches('/'),
        organization_id,
        API_VERSION
    )
}

#[derive(Serialize)]
struct Request<'a> {
    data: RequestData<'a>,
}

#[derive(Serialize)]
struct RequestData<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    attributes: RequestAttributes<'a>,
}

#[derive(Serialize)]
struct RequestAttributes<'a> {
    cluster_name: &'a str,
    resources: Vec<Resource<'a>>,
}

#[derive(Serialize)]
struct Resource<'a> {
    manifest_blob: &'a serde_json::Value,
    preferred_version: &'a str,
    scanned_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted_at: Option<String>,
}

fn rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct UploadClient {
    endpoint: String,
    cluster_name: String,
    token: String,
    http: reqwest::Client,
    tracker: Arc<FailureTracker>,
}

impl UploadClient {
    /// The underlying client honors proxy environment variables.
    pub fn new(cluster_name: &str, egress: &EgressSettings, tracker: Arc<FailureTracker>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(egress.timeout)
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            endpoint: endpoint_for(&egress.base_url, &egress.organization_id),
            cluster_name: cluster_name.to_string(),
            token: egress.token.clone(),
            http,
            tracker,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Request body for a batch; every resource shares one `scanned_at`.
    pub fn encode(&self, batch: &Batch, scanned_at: DateTime<Utc>) -> Result<Vec<u8>, UploadError> {
        let scanned_at = rfc3339(&scanned_at);
        let resources = batch
            .events
            .iter()
            .map(|e| Resource {
                manifest_blob: &e.object,
                preferred_version: &e.preferred_version,
                scanned_at: scanned_at.clone(),
                deleted_at: e.deleted_at.as_ref().map(rfc3339),
            })
            .collect();
        let req = Request {
            data: RequestData {
                kind: RESOURCE_TYPE,
                attributes: RequestAttributes { cluster_name: &self.cluster_name, resources },
            },
        };
        serde_json::to_vec(&req).map_err(|e| UploadError::Encode(e.to_string()))
    }

    async fn post(&self, batch: &Batch) -> Result<(), UploadError> {
        let body = self.encode(batch, Utc::now())?;
        let resp = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON_API)
            .header(AUTHORIZATION, format!("token {}", self.token))
            .header(REQUEST_ID_HEADER, batch.request_id.as_str())
            .body(body)
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        debug!(request_id = %batch.request_id, headers = ?resp.headers(), "error response HTTP headers");
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => format!("<could not read body: {}>", e),
        };
        Err(UploadError::Status { code: status.as_u16(), body })
    }
}

#[async_trait::async_trait]
impl Upload for UploadClient {
    async fn send(&self, batch: Batch) -> Result<(), UploadError> {
        let result = self.post(&batch).await;
        match &result {
            Ok(()) => {
                for e in &batch.events {
                    self.tracker.record_success(&e.identity());
                }
                debug!(request_id = %batch.request_id, size = batch.len(), "uploaded batch");
            }
            Err(err) => {
                if let Some(code) = err.status_code() {
                    for e in &batch.events {
                        self.tracker.record_failure_aliased(&e.identity(), &e.name_key(), code);
                    }
                }
                error!(request_id = %batch.request_id, size = batch.len(), error = %err, "could not upload batch");
            }
        }
        result
    }
}
