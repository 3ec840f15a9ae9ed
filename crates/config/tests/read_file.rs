#![forbid(unsafe_code)]

use std::io::Write;

use scanner_config::{read, ConfigError};
use tempfile::NamedTempFile;

fn config_file(body: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const FULL: &str = r#"
clusterName: prod-eu
organizationID: 0b1c2d3e-org
metricsAddress: 127.0.0.1:9100
scanning:
  requeueAfterSecs: 600
  types:
    - apiGroups: [""]
      resources: ["pods", "services"]
      namespaces: ["default"]
    - apiGroups: ["apps"]
      resources: ["deployments"]
      versions: ["*"]
egress:
  snykAPIBaseURL: https://api.eu.snyk.io
  httpClientTimeoutSecs: 30
batching:
  maxItems: 50
  maxIntervalSecs: 2
controller:
  workers: 8
"#;

#[test]
fn full_document_round_trips_into_config() {
    let file = config_file(FULL);
    let cfg = read(file.path(), "tok").unwrap();

    assert_eq!(cfg.cluster_name, "prod-eu");
    assert_eq!(cfg.organization_id, "0b1c2d3e-org");
    assert_eq!(cfg.metrics_address.port(), 9100);
    assert_eq!(cfg.probe_address.port(), 8081);
    assert_eq!(cfg.scanning.requeue_after_secs, 600);
    assert_eq!(cfg.scanning.types.len(), 2);
    assert_eq!(cfg.scanning.types[0].namespaces, Some(vec!["default".to_string()]));
    assert!(cfg.scanning.types[0].versions.is_empty());
    assert_eq!(cfg.scanning.types[1].versions, vec!["*".to_string()]);
    assert_eq!(cfg.scanning.types[1].namespaces, None);
    assert_eq!(cfg.egress.snyk_api_base_url, "https://api.eu.snyk.io");
    assert_eq!(cfg.http_timeout().as_secs(), 30);
    assert_eq!(cfg.batching.max_items, 50);
    assert_eq!(cfg.batch_interval().as_secs(), 2);
    assert_eq!(cfg.workers(), 8);
}

#[test]
fn missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.yaml");
    match read(&path, "tok") {
        Err(ConfigError::Read { path: p, .. }) => assert_eq!(p, path),
        other => panic!("expected a read error, got {:?}", other),
    }
}

#[test]
fn malformed_yaml_is_a_parse_error() {
    let file = config_file("clusterName: [unterminated\n");
    assert!(matches!(read(file.path(), "tok"), Err(ConfigError::Parse(_))));
}
