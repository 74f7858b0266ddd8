//! HTTP front door
//!
//! Routes:
//! - `POST /` - queue a build job, answer immediately
//! - `POST /variables` - upsert the shared environment Secret
//! - `GET /healthcheck` - liveness

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::secrets::SecretManager;
use crate::worker::{BuildJob, WorkerPool};
use crate::{Error, HEALTH_PATH};

/// Failure in the synchronous accept path; always a 500 with the detail
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": self.0.to_string()})),
        )
            .into_response()
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// Build job queue
    pub jobs: Arc<WorkerPool>,
    /// Secret upsert target, if a Secret is configured
    pub secrets: Option<Arc<SecretManager>>,
}

/// Create the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(submit_build))
        .route("/variables", post(upsert_variables))
        .route(HEALTH_PATH, get(healthcheck))
        .with_state(state)
}

/// Bind `addr` and serve until the process exits
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn submit_build(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let mut job: BuildJob = serde_json::from_slice(&body)?;
    job.request_id = Uuid::new_v4().to_string();
    state.jobs.submit(job)?;
    Ok(Json(json!({"success": true})))
}

async fn upsert_variables(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secrets = state
        .secrets
        .as_ref()
        .ok_or_else(|| Error::config("SECRET_NAME is not configured"))?;
    let values = plaintext_values(serde_json::from_slice(&body)?);
    let outcome = secrets.upsert(&values).await?;
    info!(secret = %secrets.name(), outcome = ?outcome, "variables stored");
    Ok(Json(json!({"success": true})))
}

async fn healthcheck() -> &'static str {
    "ok"
}

/// Flatten a JSON object into string values; non-strings keep their JSON text
pub fn plaintext_values(map: Map<String, Value>) -> BTreeMap<String, String> {
    map.into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, text)
        })
        .collect()
}
