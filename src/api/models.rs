//! API models for the job endpoints
//!
//! The HTTP surface is a thin presentation of the dispatcher operations:
//! submit accepts a kind plus params, status and download address jobs by
//! id, and listing reads the workstation's local records. Every id that
//! arrives in a path is sanitized before it touches the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobKind, JobParams, JobStatus, Manifest};

#[derive(Debug, Deserialize, Serialize)]
pub struct SubmitRequest {
    pub kind: JobKind,
    pub params: JobParams,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListEntry {
    pub job_id: String,
    pub job_type: JobKind,
    pub created_at: DateTime<Utc>,
}

impl From<&Manifest> for JobListEntry {
    fn from(manifest: &Manifest) -> Self {
        Self {
            job_id: manifest.job_id.clone(),
            job_type: manifest.job_type,
            created_at: manifest.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub job_id: String,
    pub files: Vec<String>,
}

/// Wire shape of every error: one line of text plus a stable code.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: String,
}
