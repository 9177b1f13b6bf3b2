//! Control-plane service for the compute grid.
//!
//! Exposes submission, result queries, and session cancellation over HTTP,
//! and optionally runs the reclamation loop in-process. This crate is
//! intentionally small and designed to be reused by the harness while
//! freezing the control-plane semantics.

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

pub mod reclaim;
pub mod results;
pub mod submit;

use reclaim::Reclaimer;
use results::QueryApi;
use submit::{SubmitRequest, Submitter};

/// Transient server-side failures on the submission path.
const STATUS_SUBMIT_TRANSIENT: u16 = 543;
/// Server-side failures on the read/cancel path.
const STATUS_QUERY_FAILURE: u16 = 542;

pub struct ControlPlane {
    pub submitter: Submitter,
    pub query: QueryApi,
    pub reclaimer: Arc<Reclaimer>,
}

#[derive(Clone)]
struct AppState {
    plane: Arc<ControlPlane>,
}

#[derive(Debug)]
pub struct ControlServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl ControlServer {
    pub async fn start(
        plane: ControlPlane,
        bind: SocketAddr,
        enable_reclaimer: bool,
        reclaimer_poll: Duration,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind control plane to {bind}"))?;
        let addr = listener.local_addr().context("control plane local_addr")?;

        let plane = Arc::new(plane);
        let state = AppState {
            plane: plane.clone(),
        };
        let app = build_router(state);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_control(
            listener,
            app,
            plane,
            shutdown_tx.clone(),
            shutdown_rx,
            enable_reclaimer,
            reclaimer_poll,
        ));

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join control plane task")??;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_control(
    listener: TcpListener,
    app: Router,
    plane: Arc<ControlPlane>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    enable_reclaimer: bool,
    reclaimer_poll: Duration,
) -> anyhow::Result<()> {
    let mut bg = Vec::<JoinHandle<grid_core::Result<()>>>::new();
    if enable_reclaimer {
        bg.push(tokio::spawn(
            plane
                .reclaimer
                .clone()
                .run_loop(reclaimer_poll, shutdown_rx.clone()),
        ));
    }

    let mut server_shutdown = shutdown_rx.clone();
    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });

    // The background loop must always stop when the server ends, including
    // on error paths.
    let server_res = server.await;
    let _ = shutdown_tx.send(true);

    for handle in bg {
        let _ = handle.await;
    }

    server_res.context("control plane serve")?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/submit", post(handle_submit))
        .route("/result", get(handle_result))
        .route("/cancel", post(handle_cancel))
        .with_state(state)
}

async fn handle_submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<Json<submit::SubmitResponse>> {
    state
        .plane
        .submitter
        .validate(&req)
        .map_err(ApiError::bad_request)?;

    let response = state
        .plane
        .submitter
        .submit(&req)
        .await
        .map_err(|err| ApiError::from_grid(err, STATUS_SUBMIT_TRANSIENT))?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct SubmissionContentQuery {
    submission_content: String,
}

#[derive(Debug, Deserialize)]
struct ResultRequest {
    session_id: String,
}

async fn handle_result(
    State(state): State<AppState>,
    Query(query): Query<SubmissionContentQuery>,
) -> ApiResult<Json<results::ResultsResponse>> {
    let req: ResultRequest = decode_submission_content(&query.submission_content)?;
    let response = state
        .plane
        .query
        .results(&req.session_id)
        .await
        .map_err(|err| ApiError::from_grid(err, STATUS_QUERY_FAILURE))?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    session_ids_to_cancel: Vec<String>,
}

async fn handle_cancel(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<Json<std::collections::BTreeMap<String, results::CancelCounts>>> {
    let req: CancelRequest = decode_submission_content(body.trim())?;
    let response = state
        .plane
        .query
        .cancel(&req.session_ids_to_cancel)
        .await
        .map_err(|err| ApiError::from_grid(err, STATUS_QUERY_FAILURE))?;
    Ok(Json(response))
}

/// Decodes the `base64url(json(...))` content convention shared by the
/// result and cancel endpoints.
fn decode_submission_content<T: serde::de::DeserializeOwned>(content: &str) -> ApiResult<T> {
    let bytes = base64::engine::general_purpose::URL_SAFE
        .decode(content)
        .map_err(|_| ApiError::bad_request("submission_content is not valid base64url"))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::bad_request("submission_content does not decode to expected json"))
}

pub fn encode_submission_content<T: serde::Serialize>(value: &T) -> anyhow::Result<String> {
    let json = serde_json::to_vec(value).context("encode submission content")?;
    Ok(base64::engine::general_purpose::URL_SAFE.encode(json))
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn from_grid(err: grid_core::Error, transient_status: u16) -> Self {
        let status = match err.kind() {
            grid_core::ErrorKind::Condition => StatusCode::CONFLICT,
            grid_core::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            grid_core::ErrorKind::Throttled | grid_core::ErrorKind::Fatal => {
                tracing::error!(
                    event = "grid.control.upstream_error",
                    error = %err,
                    "control plane upstream error"
                );
                StatusCode::from_u16(transient_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
