//! Build job endpoints: submit, status, result, cancel.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;
use dispatchd_core::{BuildConfig, JobResultInfo, JobStatusInfo};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/submit", post(submit))
        .route("/status/{job_id}", get(status))
        .route("/result/{job_id}", get(result))
        .route("/cancel/{job_id}", post(cancel))
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(flatten)]
    pub config: BuildConfig,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Resolve the repository to a local working copy, then enqueue a build
/// job against it. The response carries the id to poll.
async fn submit(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;

    let repo_path = state
        .cache
        .resolve(&req.repo_url, &req.branch, req.commit_hash.as_deref())
        .await?;

    let job_id = state.scheduler.submit(repo_path, req.config);
    info!(job_id = %job_id, repo_url = %req.repo_url, "Submitted build job");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "job_id": job_id,
            "message": "Compilation job created successfully"
        })),
    ))
}

async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusInfo>, ApiError> {
    state
        .scheduler
        .status(&job_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Job not found".to_string()))
}

async fn result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResultInfo>, ApiError> {
    let result = state
        .scheduler
        .result(&job_id)
        .ok_or_else(|| ApiError::NotFound("Job not found".to_string()))?;

    if !result.completed {
        return Err(ApiError::Conflict("Job is still in progress".to_string()));
    }
    Ok(Json(result))
}

async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.scheduler.status(&job_id).is_none() {
        return Err(ApiError::NotFound("Job not found".to_string()));
    }

    let cancelled = state.scheduler.cancel(&job_id);
    Ok(Json(json!({
        "job_id": job_id,
        "cancelled": cancelled
    })))
}
