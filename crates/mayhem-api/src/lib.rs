//! ---
//! mayhem_section: "05-external-interfaces"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "HTTP API for injections, telemetry and experiment history."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use mayhem_core::{
    ChaosInjectionEngine, Escalation, Experiment, ExperimentId, ExperimentPlan, ExperimentStatus,
    Feedback, InjectError, InjectionAck, InjectionRequest, LedgerError, RequesterMetadata,
    ResourceUsage, RiskAssessment, RiskAssessor, ScenarioPlanner, Suggestion, SystemSnapshot,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Hard ceiling for `/chaos-history?limit=`.
pub const MAX_HISTORY_LIMIT: usize = 100;
const SYNTHETIC_HISTORY_LEN: usize = 3;

/// Shared state handed to every handler.
pub struct ApiState {
    engine: Arc<ChaosInjectionEngine>,
    planner: ScenarioPlanner,
    assessor: RiskAssessor,
    history_limit: usize,
}

impl ApiState {
    pub fn new(engine: Arc<ChaosInjectionEngine>, history_limit: usize) -> Self {
        let planner = ScenarioPlanner::new(Arc::clone(engine.registry()));
        Self {
            engine,
            planner,
            assessor: RiskAssessor::new(),
            history_limit: history_limit.clamp(1, MAX_HISTORY_LIMIT),
        }
    }

    fn snapshot(&self) -> Result<SystemSnapshot, mayhem_core::MetricsUnavailableError> {
        self.engine.metrics_source().snapshot()
    }

    fn assess(&self, snapshot: &SystemSnapshot) -> RiskAssessment {
        self.assessor.assess(&snapshot.usage())
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("history_limit", &self.history_limit)
            .finish_non_exhaustive()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Routes without a listener attached.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/inject", post(post_inject))
        .route("/scenarios", get(get_scenarios))
        .route("/scenarios/suggest", post(post_suggest))
        .route("/scenarios/escalate", post(post_escalate))
        .route("/system-status", get(get_system_status))
        .route("/risk", get(get_risk))
        .route("/chaos-history", get(get_history))
        .route("/experiments/:id", get(get_experiment))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve the API until [`ApiServer::shutdown`] is called.
pub fn spawn_api_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<ApiServer> {
    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let bound = listener
        .local_addr()
        .context("failed to resolve API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %bound, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %bound, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.kind,
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<InjectError> for ApiError {
    fn from(err: InjectError) -> Self {
        match &err {
            InjectError::Validation(validation) => {
                ApiError::new(StatusCode::BAD_REQUEST, validation.code(), err.to_string())
            }
            InjectError::Saturated { .. } => {
                ApiError::new(StatusCode::TOO_MANY_REQUESTS, "saturated", err.to_string())
            }
            InjectError::Interrupted => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
            }
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "not_found", err.to_string())
            }
            other => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "ledger_unavailable",
                other.to_string(),
            ),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "invalid_query", rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "invalid_path", rejection.body_text())
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_workloads: usize,
}

async fn get_health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_workloads: state.engine.active_workloads(),
    })
}

async fn post_inject(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<InjectionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InjectionAck>), ApiError> {
    let Json(request) = payload?;
    let requester = RequesterMetadata {
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
        client_ip: Some(peer.ip().to_string()),
    };
    let ack = state.engine.inject(&request, requester).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

#[derive(Debug, Serialize)]
struct ScenarioList {
    scenarios: Vec<String>,
}

async fn get_scenarios(State(state): State<Arc<ApiState>>) -> Json<ScenarioList> {
    Json(ScenarioList {
        scenarios: state.engine.registry().ids().map(str::to_owned).collect(),
    })
}

#[derive(Debug, Deserialize)]
struct SuggestRequest {
    #[serde(default)]
    past_failures: Vec<String>,
    /// Defaults to the current host usage when omitted.
    #[serde(default)]
    usage: Option<ResourceUsage>,
}

#[derive(Debug, Serialize)]
struct SuggestResponse {
    suggestions: Vec<Suggestion>,
}

async fn post_suggest(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<SuggestRequest>, JsonRejection>,
) -> Result<Json<SuggestResponse>, ApiError> {
    let Json(request) = payload?;
    let usage = match request.usage {
        Some(usage) => usage,
        None => state
            .snapshot()
            .map(|snapshot| snapshot.usage())
            .unwrap_or_default(),
    };
    Ok(Json(SuggestResponse {
        suggestions: state.planner.suggest(&request.past_failures, &usage),
    }))
}

#[derive(Debug, Deserialize)]
struct EscalateRequest {
    plan: ExperimentPlan,
    feedback: Feedback,
    #[serde(default)]
    add_network_partition: bool,
}

async fn post_escalate(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<EscalateRequest>, JsonRejection>,
) -> Result<Json<Escalation>, ApiError> {
    let Json(request) = payload?;
    Ok(Json(state.planner.evolve(
        &request.plan,
        request.feedback,
        request.add_network_partition,
    )))
}

async fn get_system_status(State(state): State<Arc<ApiState>>) -> Json<Value> {
    match state.snapshot() {
        Ok(snapshot) => {
            let risk = state.assess(&snapshot);
            Json(json!({
                "system_metrics": snapshot,
                "risk": risk,
                "active_workloads": state.engine.active_workloads(),
            }))
        }
        Err(err) => {
            warn!(error = %err, "serving degraded system status");
            Json(json!({
                "system_metrics": { "error": err.message, "degraded": true },
                "active_workloads": state.engine.active_workloads(),
            }))
        }
    }
}

async fn get_risk(State(state): State<Arc<ApiState>>) -> Result<Json<RiskAssessment>, ApiError> {
    let snapshot = state.snapshot().map_err(|err| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics_unavailable",
            err.to_string(),
        )
    })?;
    Ok(Json(state.assess(&snapshot)))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    experiments: Vec<Experiment>,
    synthetic: bool,
}

async fn get_history(
    State(state): State<Arc<ApiState>>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(query) = query?;
    let limit = query
        .limit
        .unwrap_or(state.history_limit)
        .clamp(1, MAX_HISTORY_LIMIT);
    let response = match state.engine.ledger().list(limit).await {
        Ok(experiments) => HistoryResponse {
            experiments,
            synthetic: false,
        },
        Err(err) => {
            warn!(error = %err, "ledger unavailable, serving synthetic history");
            HistoryResponse {
                experiments: synthetic_history(&state, limit.min(SYNTHETIC_HISTORY_LEN)),
                synthetic: true,
            }
        }
    };
    Ok(Json(response))
}

/// Placeholder rows shown while the ledger cannot be read.
fn synthetic_history(state: &ApiState, count: usize) -> Vec<Experiment> {
    let now = Utc::now();
    state
        .engine
        .registry()
        .iter()
        .take(count)
        .enumerate()
        .map(|(index, descriptor)| {
            let start_time = now - ChronoDuration::hours(index as i64 + 1);
            Experiment {
                id: 0,
                scenario: descriptor.id.clone(),
                duration: 60,
                intensity: mayhem_core::Intensity::Medium,
                status: ExperimentStatus::Completed,
                start_time,
                end_time: Some(start_time + ChronoDuration::seconds(60)),
                result: Some(format!("{} (sample)", descriptor.title)),
                metrics_before: None,
                metrics_after: None,
                error_message: None,
                requester: RequesterMetadata::default(),
            }
        })
        .collect()
}

async fn get_experiment(
    State(state): State<Arc<ApiState>>,
    id: Result<Path<ExperimentId>, PathRejection>,
) -> Result<Json<Experiment>, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.engine.ledger().get(id).await?))
}
