//! # Control channel & health API
//!
//! This crate provides the HTTP surface of the server:
//!
//! - `/health`, `/ping` for liveness
//! - `/metrics` for the prometheus process metrics
//! - `/v1/leases` to page through the lease table
//! - `POST /command` for the statistics control commands
//!   (`statistic-get`, `statistic-reset`, `statistic-remove` and their
//!   `-all` variants)
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use axum::{Router, extract::Extension, routing};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use config::DhcpConfig;
use lease_store::LeaseStore;
use stats::StatsMgr;

/// reported server health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// serving
    Good,
    /// starting up or failing
    Bad,
}

/// shared health cell
pub type State = Arc<Mutex<Health>>;

/// The task runner for the [`ExternalApi`]
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiGuard drop called");
        self.task_handle.abort();
    }
}

/// Listens to relevant channels to gather information about the running
/// system and reports this data over HTTP
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    store: Arc<LeaseStore>,
    stats: Arc<StatsMgr>,
    cfg: Arc<DhcpConfig>,
}

impl ExternalApi {
    /// Create a new ExternalApi instance
    pub fn new(
        addr: SocketAddr,
        cfg: Arc<DhcpConfig>,
        store: Arc<LeaseStore>,
        stats: Arc<StatsMgr>,
    ) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        Self {
            tx,
            rx,
            addr,
            state: Arc::new(Mutex::new(Health::Bad)),
            store,
            stats,
            cfg,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock().expect("health lock poisoned");
            if *guard != health {
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// serve the HTTP external api
    async fn run(
        addr: SocketAddr,
        state: State,
        cfg: Arc<DhcpConfig>,
        store: Arc<LeaseStore>,
        stats: Arc<StatsMgr>,
        token: CancellationToken,
    ) -> Result<()> {
        const TIMEOUT: u64 = 30;
        use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
        let service = Router::new()
            .route("/health", routing::get(handlers::health))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/v1/leases", routing::get(handlers::leases))
            .route("/config", routing::get(handlers::config_info))
            .route("/command", routing::post(handlers::command))
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(TIMEOUT)))
            .layer(Extension(state))
            .layer(Extension(store))
            .layer(Extension(stats))
            .layer(Extension(cfg));

        let tcp = TcpListener::bind(&addr).await?;
        tracing::debug!(%addr, "external API listening");

        axum::serve(tcp, service)
            .with_graceful_shutdown(async move {
                token.cancelled().await;
            })
            .await?;
        Ok(())
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self, token: CancellationToken) -> ExternalApiGuard {
        let state = Arc::clone(&self.state);
        let addr = self.addr;
        let store = Arc::clone(&self.store);
        let stats = Arc::clone(&self.stats);
        let cfg = Arc::clone(&self.cfg);

        let task_handle = tokio::spawn(async move {
            tokio::select! {
                res = ExternalApi::run(addr, state, cfg, store, stats, token) => {
                    if let Err(err) = res {
                        error!(?err, "external api exited with error");
                    }
                }
                res = self.listen_status() => {
                    if let Err(err) = res {
                        error!(?err, "health listener exited with error");
                    }
                }
            }
        });
        ExternalApiGuard { task_handle }
    }
}

mod handlers {
    use super::*;
    use axum::{Json, http::StatusCode, response::IntoResponse};
    use chrono::SecondsFormat;
    use serde_json::json;

    pub(crate) async fn health(Extension(state): Extension<State>) -> impl IntoResponse {
        match *state.lock().expect("health lock poisoned") {
            Health::Good => (StatusCode::OK, "OK"),
            Health::Bad => (StatusCode::SERVICE_UNAVAILABLE, "BAD"),
        }
    }

    pub(crate) async fn ping() -> &'static str {
        "pong"
    }

    pub(crate) async fn metrics() -> impl IntoResponse {
        use prometheus::{Encoder, TextEncoder};
        let encoder = TextEncoder::new();
        let mut out = Vec::new();
        if let Err(err) = encoder.encode(&prometheus::gather(), &mut out) {
            error!(?err, "failed to encode metrics");
            return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
        }
        (StatusCode::OK, out)
    }

    /// one page of the lease table as JSON
    pub(crate) async fn leases(
        Extension(store): Extension<Arc<LeaseStore>>,
    ) -> impl IntoResponse {
        const PAGE: usize = 1_000;
        let rows: Vec<serde_json::Value> = store
            .iter_page(None, PAGE)
            .into_iter()
            .map(|lease| {
                json!({
                    "address": lease.addr.to_string(),
                    "hwaddr": hex_colon(&lease.hwaddr),
                    "client_id": lease.client_id.as_deref().map(hex_colon),
                    "subnet_id": lease.subnet_id,
                    "valid_lifetime": lease.valid_lifetime,
                    "cltt": lease.cltt.to_rfc3339_opts(SecondsFormat::Micros, true),
                    "expires_at": lease
                        .expire_time()
                        .to_rfc3339_opts(SecondsFormat::Micros, true),
                    "state": lease.state.as_u8(),
                    "hostname": lease.hostname,
                })
            })
            .collect();
        Json(json!({ "leases": rows }))
    }

    /// the loaded configuration, summarized
    pub(crate) async fn config_info(
        Extension(cfg): Extension<Arc<DhcpConfig>>,
    ) -> impl IntoResponse {
        let subnets: Vec<serde_json::Value> = cfg
            .v4()
            .networks()
            .iter()
            .map(|net| {
                json!({
                    "subnet": net.subnet().to_string(),
                    "id": net.subnet_id(),
                    "authoritative": net.authoritative(),
                })
            })
            .collect();
        Json(json!({
            "path": cfg.path().map(|p| p.display().to_string()),
            "subnets": subnets,
            "v6": cfg.has_v6(),
        }))
    }

    /// dispatch one control command. The body is
    /// `{"command": "...", "arguments": {...}}` and the response is the
    /// standard `{"result": 0|1, "text": ..., "arguments": ...}` envelope.
    pub(crate) async fn command(
        Extension(stats): Extension<Arc<StatsMgr>>,
        Json(body): Json<serde_json::Value>,
    ) -> impl IntoResponse {
        let Some(command) = body.get("command").and_then(|c| c.as_str()) else {
            return Json(json!({
                "result": stats::commands::RESULT_ERROR,
                "text": "Missing mandatory 'command' parameter."
            }));
        };
        let arguments = body.get("arguments");
        Json(stats::commands::dispatch(&stats, command, arguments))
    }

    fn hex_colon(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}
