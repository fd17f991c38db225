//! REST interface over the dispatcher and the liveness monitor.
//!
//! | Method | Path | |
//! |--------|------|-|
//! | POST | `/shovey/jobs` | submit a job |
//! | GET | `/shovey/jobs` | list jobs (`status`, `offset`, `limit`) |
//! | GET | `/shovey/jobs/:id` | job with per-node summary |
//! | GET | `/shovey/jobs/:id/:node` | one run with output and history |
//! | PUT | `/shovey/cancel/:id` | cancel a job or some of its nodes |
//! | GET | `/shovey/stream/:id/:node` | long-poll output (`sequence`, `wait_ms`) |
//! | GET | `/status/all/nodes` | latest status of every node (`status`) |
//! | GET | `/status/node/:name/all` | one node's status history |
//! | GET | `/status/node/:name/latest` | one node's latest status |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::dispatch::{
    CancelOutcome, Dispatcher, JobFilter, JobPage, JobStatus, JobView, OutputBatch, Quorum,
    RunDetail, SubmitRequest, TargetSpec,
};
use crate::error::ShoveyError;
use crate::liveness::{LivenessMonitor, NodeFilter, NodeRecord, NodeStatus};

/// Upper bound on how long a stream request may wait for output
const MAX_STREAM_WAIT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub monitor: Arc<LivenessMonitor>,
}

#[derive(Debug)]
pub enum ApiError {
    Shovey(ShoveyError),
    BadRequest(String),
}

impl From<ShoveyError> for ApiError {
    fn from(e: ShoveyError) -> Self {
        ApiError::Shovey(e)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Shovey(e) => {
                let status = if e.is_input_error() {
                    StatusCode::BAD_REQUEST
                } else if e.is_not_found() {
                    StatusCode::NOT_FOUND
                } else if matches!(e, ShoveyError::JobTableFull) {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    tracing::error!(error = %e, "Request failed");
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    command: String,
    #[serde(default)]
    nodes: Option<Vec<String>>,
    #[serde(default)]
    search: Option<String>,
    /// `"3"`, `"60%"` or a bare count
    #[serde(default)]
    quorum: Option<serde_json::Value>,
    /// Seconds
    #[serde(default)]
    run_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    nodes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    sequence: Option<u64>,
    wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NodeStatusQuery {
    status: Option<String>,
}

#[derive(Serialize)]
struct NodeStatusResponse {
    name: String,
    status: NodeStatus,
    last_seen: DateTime<Utc>,
}

impl From<&NodeRecord> for NodeStatusResponse {
    fn from(record: &NodeRecord) -> Self {
        Self {
            name: record.name.clone(),
            status: record.status,
            last_seen: record.last_seen,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/shovey/jobs", post(submit_job_handler).get(list_jobs_handler))
        .route("/shovey/jobs/:id", get(get_job_handler))
        .route("/shovey/jobs/:id/:node", get(run_detail_handler))
        .route("/shovey/cancel/:id", put(cancel_handler))
        .route("/shovey/stream/:id/:node", get(stream_handler))
        .route("/status/all/nodes", get(list_nodes_handler))
        .route("/status/node/:name/all", get(node_history_handler))
        .route("/status/node/:name/latest", get(node_latest_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn parse_quorum(value: Option<serde_json::Value>) -> Result<Quorum, ShoveyError> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(Quorum::default()),
        Some(serde_json::Value::String(s)) => s.parse(),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .and_then(|count| usize::try_from(count).ok())
            .map(Quorum::Count)
            .ok_or_else(|| ShoveyError::InvalidQuorum(format!("cannot parse '{}'", n))),
        Some(other) => Err(ShoveyError::InvalidQuorum(format!(
            "expected a count or a percentage, got {}",
            other
        ))),
    }
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    let Json(payload) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let quorum = parse_quorum(payload.quorum)?;
    let targets = match (payload.nodes, payload.search) {
        (Some(nodes), None) => TargetSpec::Nodes(nodes),
        (None, Some(search)) => TargetSpec::Search(search),
        (None, None) => return Err(ShoveyError::EmptyTargets.into()),
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest(
                "give either nodes or search, not both".to_string(),
            ))
        }
    };

    let request = SubmitRequest {
        command: payload.command,
        targets,
        quorum,
        run_timeout: payload.run_timeout.map(Duration::from_secs),
    };
    let job = state.dispatcher.submit(request).await?;
    let view = state.dispatcher.get_job(job.id).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<JobPage>> {
    let status = query
        .status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let filter = JobFilter {
        status,
        offset: query.offset.unwrap_or(0),
        limit: query.limit,
    };
    Ok(Json(state.dispatcher.list_jobs(&filter).await))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.dispatcher.get_job(id).await?))
}

async fn run_detail_handler(
    State(state): State<ApiState>,
    Path((id, node)): Path<(Uuid, String)>,
) -> ApiResult<Json<RunDetail>> {
    Ok(Json(state.dispatcher.run_detail(id, &node).await?))
}

async fn cancel_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Json<CancelOutcome>> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let outcome = state.dispatcher.cancel(id, request.nodes.as_deref()).await?;
    Ok(Json(outcome))
}

async fn stream_handler(
    State(state): State<ApiState>,
    Path((id, node)): Path<(Uuid, String)>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Json<OutputBatch>> {
    let wait = query
        .wait_ms
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
        .min(MAX_STREAM_WAIT);
    let batch = state
        .dispatcher
        .stream_output(id, &node, query.sequence, wait)
        .await?;
    Ok(Json(batch))
}

async fn list_nodes_handler(
    State(state): State<ApiState>,
    Query(query): Query<NodeStatusQuery>,
) -> ApiResult<Json<Vec<NodeStatusResponse>>> {
    let status = query
        .status
        .map(|s| s.parse::<NodeStatus>())
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let nodes = state.monitor.list(&NodeFilter { status }).await;
    Ok(Json(nodes.iter().map(NodeStatusResponse::from).collect()))
}

async fn node_history_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<NodeRecord>> {
    let record = state
        .monitor
        .status(&name)
        .await
        .ok_or(ShoveyError::NodeNotFound(name))?;
    Ok(Json(record))
}

async fn node_latest_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<NodeStatusResponse>> {
    let record = state
        .monitor
        .status(&name)
        .await
        .ok_or(ShoveyError::NodeNotFound(name))?;
    Ok(Json(NodeStatusResponse::from(&record)))
}
