use axum::{Json, extract::Path, extract::State, http::StatusCode, response::IntoResponse};

use super::error::ApiError;
use super::models::{
    DownloadResponse, HealthResponse, JobListEntry, StatusResponse, SubmitRequest, SubmitResponse,
};
use super::state::AppState;
use crate::job::sanitize_segment;

/// Job submission endpoint (POST /jobs)
///
/// Validation happens inside the dispatcher; a rejected submit mutates
/// nothing on the store. Long-running operations never happen here — the
/// response returns as soon as the manifest upload commits.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state
        .dispatcher
        .submit(request.kind, request.params)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// Job status endpoint (GET /jobs/{id})
///
/// Returns the derived status. Ids that fail sanitization never reach
/// the store and resolve to `unknown`.
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.dispatcher.status(&job_id).await?;
    Ok(Json(StatusResponse { job_id, status }))
}

/// Job listing endpoint (GET /jobs)
///
/// Reads the workstation's local records, newest first.
pub async fn list_jobs(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let manifests = state.dispatcher.list()?;
    let entries: Vec<JobListEntry> = manifests.iter().map(JobListEntry::from).collect();
    Ok(Json(entries))
}

/// Result download endpoint (POST /jobs/{id}/download)
///
/// Mirrors `results/<id>/` into the configured output directory and
/// returns the file list.
pub async fn download_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    sanitize_segment(&job_id).map_err(|e| ApiError::Validation(e.to_string()))?;

    let files = state.dispatcher.download(&job_id, None).await?;
    Ok(Json(DownloadResponse { job_id, files }))
}

/// Health check endpoint (GET /health)
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
