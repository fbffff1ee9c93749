use std::{net::IpAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    error::EnforceError,
    handler::{ScanOutcome, ThreatHandler},
    ports,
    scanner::{PortProbe, ScanOptions, ScanProgress, ScanTarget},
};

#[derive(Clone)]
pub struct AppState {
    handler: ThreatHandler,
    recent_limit: usize,
    inner: Arc<RwLock<ServerState>>, // shared mutable state for progress/results
}

#[derive(Debug, Default)]
struct ServerState {
    status: Status,
    outcome: Option<ScanOutcome>,
    progress: Option<ScanProgress>,
    cancel: Option<CancellationToken>,
    generation: u64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Status {
    pub target: Option<String>,
    pub total: u64,
    pub scanned: u64,
    pub open: u64,
    pub state: String, // "idle" | "running" | "done" | "failed"
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub target: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct UnblockRequest {
    pub ip: IpAddr,
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub limit: Option<usize>,
}

impl AppState {
    pub fn new(handler: ThreatHandler, recent_limit: usize) -> Self {
        Self {
            handler,
            recent_limit,
            inner: Arc::new(RwLock::new(ServerState {
                status: Status {
                    state: "idle".into(),
                    ..Status::default()
                },
                ..ServerState::default()
            })),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/results", get(get_results))
        .route("/summary", get(get_summary))
        .route("/blocked", get(get_blocked))
        .route("/unblock", post(post_unblock))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let app = router(state);
    info!(%bind, "serving status API");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let mut out = s.status.clone();
    if let Some(p) = s.progress.as_ref() {
        let (total, scanned, open) = p.snapshot();
        out.total = total;
        out.scanned = scanned;
        out.open = open;
    }
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    if let Some(res) = s.outcome.as_ref() {
        (StatusCode::OK, Json(res.clone())).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn get_summary(
    State(app): State<AppState>,
    Query(q): Query<SummaryQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(app.recent_limit);
    match app
        .handler
        .ledger()
        .blocking(move |l| l.summarize(limit))
        .await
    {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => {
            error!(error = %e, "summary read failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn get_blocked(State(app): State<AppState>) -> impl IntoResponse {
    let blocked: Vec<IpAddr> = app.handler.ledger().query_blocked().into_iter().collect();
    (StatusCode::OK, Json(blocked))
}

#[derive(Debug, Serialize)]
struct UnblockResponse {
    ip: IpAddr,
    outcome: crate::enforcer::UnblockOutcome,
}

async fn post_unblock(
    State(app): State<AppState>,
    Json(req): Json<UnblockRequest>,
) -> impl IntoResponse {
    match app.handler.enforcer().unblock(req.ip).await {
        Ok(outcome) => (StatusCode::OK, Json(UnblockResponse { ip: req.ip, outcome })).into_response(),
        Err(e @ EnforceError::Firewall { .. }) => {
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> impl IntoResponse {
    let target = ScanTarget::new(req.target);
    if target.as_str().is_empty() {
        return (StatusCode::BAD_REQUEST, "target must not be empty").into_response();
    }
    if req.ports.contains(&0) {
        return (StatusCode::BAD_REQUEST, "port 0 is not scannable").into_response();
    }

    let ports = if req.ports.is_empty() {
        ports::default_ports()
    } else {
        req.ports
    };

    let base = app.handler.probe().options().clone();
    let options = ScanOptions {
        workers: req.workers.unwrap_or(base.workers),
        connect_timeout: req
            .timeout_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or(base.connect_timeout),
        scan_timeout: base.scan_timeout,
    };
    let handler = ThreatHandler::new(
        PortProbe::with_connector(app.handler.probe().connector(), options),
        app.handler.enforcer().clone(),
    );

    let total = ports.len() as u64;
    let progress = ScanProgress::new();
    let cancel = CancellationToken::new();

    let generation = {
        let mut s = app.inner.write().await;
        // Cancel any existing scan
        if let Some(c) = s.cancel.take() {
            c.cancel();
        }
        s.status = Status {
            target: Some(target.to_string()),
            total,
            scanned: 0,
            open: 0,
            state: "running".into(),
        };
        s.outcome = None;
        s.progress = Some(progress.clone());
        s.cancel = Some(cancel.clone());
        s.generation += 1;
        s.generation
    };

    let app2 = app.clone();
    let running = Status {
        target: Some(target.to_string()),
        total,
        scanned: 0,
        open: 0,
        state: "running".into(),
    };
    tokio::spawn(async move {
        let res = handler
            .scan_and_process(&target, &ports, cancel, progress.clone())
            .await;

        let mut s = app2.inner.write().await;
        // A newer scan replaced this one; leave its state alone.
        if s.generation != generation {
            return;
        }
        let (_, scanned, open) = progress.snapshot();
        s.status.scanned = scanned;
        s.status.open = open;
        s.progress = None;
        s.cancel = None;
        match res {
            Ok(outcome) => {
                s.status.state = "done".into();
                s.outcome = Some(outcome);
            }
            Err(e) => {
                s.status.state = "failed".into();
                error!(scan_target = %target, error = %e, "scan failed");
            }
        }
    });

    (StatusCode::ACCEPTED, Json(running)).into_response()
}
