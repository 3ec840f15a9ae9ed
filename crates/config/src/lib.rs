//! Scanner configuration: a YAML file plus the service account token taken
//! from the environment.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use scanner_core::ScanType;
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/kubernetes-scanner/config.yaml";
pub const TOKEN_ENV: &str = "SNYK_SERVICE_ACCOUNT_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("organization ID is not set")]
    MissingOrganizationId,
    #[error("cluster name is not set")]
    MissingClusterName,
    #[error("invalid Snyk API base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("service account token is empty; set {}", TOKEN_ENV)]
    MissingToken,
    #[error("scan type #{index}: {reason}")]
    InvalidScanType { index: usize, reason: &'static str },
    #[error("batching.maxItems must be at least 1")]
    ZeroBatchSize,
    #[error("controller.workers must be at least 1")]
    ZeroWorkers,
    #[error("egress.httpClientTimeoutSecs must be at least 1")]
    ZeroHttpTimeout,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub cluster_name: String,
    #[serde(rename = "organizationID", default)]
    pub organization_id: String,
    #[serde(default = "default_metrics_address")]
    pub metrics_address: SocketAddr,
    #[serde(default = "default_probe_address")]
    pub probe_address: SocketAddr,
    #[serde(default)]
    pub scanning: Scanning,
    #[serde(default)]
    pub egress: Egress,
    #[serde(default)]
    pub batching: Batching,
    #[serde(default)]
    pub controller: Controller,
    /// Never read from the file.
    #[serde(skip)]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scanning {
    #[serde(default)]
    pub types: Vec<ScanType>,
    #[serde(default = "default_requeue_after_secs")]
    pub requeue_after_secs: u64,
}

impl Default for Scanning {
    fn default() -> Self {
        Self { types: Vec::new(), requeue_after_secs: default_requeue_after_secs() }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Egress {
    #[serde(rename = "snykAPIBaseURL", default = "default_base_url")]
    pub snyk_api_base_url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_client_timeout_secs: u64,
}

impl Default for Egress {
    fn default() -> Self {
        Self { snyk_api_base_url: default_base_url(), http_client_timeout_secs: default_http_timeout_secs() }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batching {
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
}

impl Default for Batching {
    fn default() -> Self {
        Self { max_items: default_max_items(), max_interval_secs: default_max_interval_secs() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Controller {
    /// Concurrent reconciles per kind; defaults to `batching.maxItems`.
    #[serde(default)]
    pub workers: Option<usize>,
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}
fn default_probe_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8081))
}
fn default_requeue_after_secs() -> u64 {
    3600
}
fn default_base_url() -> String {
    "https://app.snyk.io".to_string()
}
fn default_http_timeout_secs() -> u64 {
    5
}
fn default_max_items() -> usize {
    100
}
fn default_max_interval_secs() -> u64 {
    10
}

impl Config {
    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.scanning.requeue_after_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.egress.http_client_timeout_secs)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batching.max_interval_secs)
    }

    /// Every reconcile waits for its batch, so fewer workers than
    /// `maxItems` would keep the size trigger from ever firing.
    pub fn workers(&self) -> usize {
        self.controller.workers.unwrap_or(self.batching.max_items)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.organization_id.trim().is_empty() {
            return Err(ConfigError::MissingOrganizationId);
        }
        if self.cluster_name.trim().is_empty() {
            return Err(ConfigError::MissingClusterName);
        }
        validate_base_url(&self.egress.snyk_api_base_url)?;
        if self.egress.http_client_timeout_secs == 0 {
            return Err(ConfigError::ZeroHttpTimeout);
        }
        if self.token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        for (index, st) in self.scanning.types.iter().enumerate() {
            if st.api_groups.is_empty() {
                return Err(ConfigError::InvalidScanType { index, reason: "no API groups" });
            }
            if st.resources.is_empty() {
                return Err(ConfigError::InvalidScanType { index, reason: "no resources" });
            }
        }
        if self.batching.max_items == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.controller.workers == Some(0) {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(())
    }
}

fn validate_base_url(raw: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidBaseUrl { url: raw.to_string(), reason };
    let url = reqwest::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(invalid("expected an http or https URL".to_string()));
    }
    Ok(())
}

/// Parse and validate a config document.
pub fn from_yaml_str(s: &str, token: &str) -> Result<Config, ConfigError> {
    let mut cfg: Config = serde_yaml::from_str(s)?;
    cfg.token = token.to_string();
    cfg.validate()?;
    Ok(cfg)
}

pub fn read(path: impl AsRef<Path>, token: &str) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    debug!(path = %path.display(), "read config file");
    from_yaml_str(&raw, token)
}
