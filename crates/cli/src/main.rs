use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use scanner_backend::{describe_metrics, prometheus_builder, EgressSettings, FailureTracker, UploadClient};
use scanner_config::{Config, DEFAULT_CONFIG_PATH, TOKEN_ENV};
use scanner_core::EventSink;
use scanner_kubehub::{discover_targets, run_controller};
use scanner_pipeline::{BatchConfig, BatchingPipeline};
use scanner_reconcile::{KubeObjectSource, ScanReconciler};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kube-scanner", version, about = "Scans Kubernetes resources and uploads them to Snyk")]
struct Cli {
    /// Path to the config file
    #[arg(long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Service account token for the upload API
    #[arg(long = "token", env = TOKEN_ENV, hide = true, hide_env_values = true)]
    token: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("SCANNER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() -> Result<PrometheusHandle> {
    let handle = prometheus_builder()
        .context("invalid retry histogram buckets")?
        .install_recorder()
        .context("failed to install metrics recorder")?;
    describe_metrics();
    Ok(handle)
}

#[derive(Clone)]
struct MetricsState {
    handle: PrometheusHandle,
    tracker: Arc<FailureTracker>,
}

async fn render_metrics(State(s): State<MetricsState>) -> String {
    s.tracker.publish_age();
    s.handle.render()
}

/// Ready once every controller has been spawned.
async fn readyz(State(ready): State<Arc<AtomicBool>>) -> (StatusCode, &'static str) {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn serve(addr: SocketAddr, app: Router, what: &'static str, shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not bind {} address {}", what, addr))?;
    info!(addr = %addr, what, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(stopped(shutdown))
        .await
        .with_context(|| format!("{} server failed", what))
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received; shutting down"),
        _ = term => info!("SIGTERM received; shutting down"),
    }
}

fn egress_settings(cfg: &Config) -> EgressSettings {
    EgressSettings {
        base_url: cfg.egress.snyk_api_base_url.clone(),
        organization_id: cfg.organization_id.clone(),
        token: cfg.token.clone(),
        timeout: cfg.http_timeout(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let token = cli.token.unwrap_or_default();
    let cfg = scanner_config::read(&cli.config, &token)
        .with_context(|| format!("could not load config from {}", cli.config.display()))?;
    info!(cluster = %cfg.cluster_name, scan_types = cfg.scanning.types.len(), "configuration loaded");
    if cfg.workers() < cfg.batching.max_items {
        warn!(
            workers = cfg.workers(),
            max_items = cfg.batching.max_items,
            "fewer workers per kind than batching.maxItems; batches will only flush on the interval"
        );
    }

    let metrics = init_metrics()?;
    let tracker = Arc::new(FailureTracker::new());
    let upload = Arc::new(UploadClient::new(&cfg.cluster_name, &egress_settings(&cfg), Arc::clone(&tracker))?);
    let pipeline = Arc::new(BatchingPipeline::start(
        upload,
        BatchConfig { max_items: cfg.batching.max_items, max_interval: cfg.batch_interval() },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ready = Arc::new(AtomicBool::new(false));

    let metrics_app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(MetricsState { handle: metrics, tracker: Arc::clone(&tracker) });
    let probe_app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(Arc::clone(&ready));
    let servers: Vec<JoinHandle<Result<()>>> = vec![
        tokio::spawn(serve(cfg.metrics_address, metrics_app, "metrics", shutdown_rx.clone())),
        tokio::spawn(serve(cfg.probe_address, probe_app, "probe", shutdown_rx.clone())),
    ];

    let client = kube::Client::try_default().await.context("could not create kubernetes client")?;
    let targets = discover_targets(client.clone(), &cfg.scanning.types).await?;
    if targets.is_empty() {
        warn!("no resources to watch; check scanning.types");
    }

    let sink: Arc<dyn EventSink> = pipeline.clone();
    let mut controllers = Vec::with_capacity(targets.len());
    for target in targets {
        let kind = target.kind.clone();
        let source = Arc::new(KubeObjectSource::new(client.clone(), &kind));
        let reconciler = Arc::new(ScanReconciler::new(target, source, Arc::clone(&sink), cfg.requeue_after()));
        controllers.push((
            kind.gvk_key(),
            tokio::spawn(run_controller(client.clone(), kind, reconciler, cfg.workers(), shutdown_rx.clone())),
        ));
    }
    ready.store(true, Ordering::SeqCst);
    info!(controllers = controllers.len(), "scanner started");

    wait_for_signal().await;
    let _ = shutdown_tx.send(true);

    for (gvk, handle) in controllers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(gvk = %gvk, error = ?e, "controller failed"),
            Err(e) => error!(gvk = %gvk, error = %e, "controller task panicked"),
        }
    }
    pipeline.shutdown().await;

    for handle in servers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = ?e, "server failed"),
            Err(e) => error!(error = %e, "server task panicked"),
        }
    }
    let stats = tracker.stats();
    info!(open_failures = stats.open_failures, "scanner stopped");
    Ok(())
}
