//! Job model: kinds, manifests, and validation
//!
//! A manifest is the wire-stable JSON record describing one job. It is
//! written once by the dispatcher and never rewritten; a job's status is
//! derived from which store prefix currently holds its manifest, not from
//! any field inside it. Unknown fields are preserved on round-trip so that
//! newer dispatchers can talk to older workers.

pub mod id;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use id::{IdError, MAX_SEGMENT_LEN, generate as generate_id, sanitize_rel_path, sanitize_segment};

/// The eight camera angles a `render` job produces per character.
pub const RENDER_ANGLES: [&str; 8] = [
    "front",
    "front_right",
    "right",
    "back_right",
    "back",
    "back_left",
    "left",
    "front_left",
];

/// Closed set of execution recipes. Extending this enum is a code change
/// on both the workstation and the worker fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Render,
    Character,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Render => "render",
            JobKind::Character => "character",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "render" => Ok(JobKind::Render),
            "character" => Ok(JobKind::Character),
            other => Err(ManifestError::UnknownKind(other.to_string())),
        }
    }
}

/// Recipe-specific parameters carried inside a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    /// Store-relative script path under `scripts/`.
    pub script: String,
    /// Character names, `render` jobs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characters: Option<Vec<String>>,
    /// Output subpath under the worker's `output/` tree.
    pub output_dir: String,
    /// Arbitrary scalar overrides passed to the tool as `--param K=V`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<BTreeMap<String, Value>>,
    /// Store-relative asset paths under `assets/` the worker must stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<String>,
    /// Forward-compatibility: fields this build does not know about.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Immutable description of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub job_id: String,
    pub job_type: JobKind,
    pub created_at: DateTime<Utc>,
    pub params: JobParams,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Manifest {
    /// Build a manifest with a freshly generated id and timestamp.
    pub fn new(kind: JobKind, params: JobParams) -> Self {
        Self {
            job_id: id::generate(kind),
            job_type: kind,
            created_at: Utc::now(),
            params,
            extra: BTreeMap::new(),
        }
    }
}

/// Derived status of a job, computed from store contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Unknown,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("unknown job kind: {0}")]
    UnknownKind(String),

    #[error("job id invalid: {0}")]
    InvalidId(IdError),

    #[error("script path invalid: {0}")]
    InvalidScript(IdError),

    #[error("output_dir invalid: {0}")]
    InvalidOutputDir(IdError),

    #[error("character name {0:?} invalid: {1}")]
    InvalidCharacter(String, IdError),

    #[error("asset path {0:?} invalid: {1}")]
    InvalidAsset(String, IdError),

    #[error("characters list is empty")]
    EmptyCharacters,
}

/// Validate everything in a manifest that will be interpolated into an
/// object key or a filesystem path. Runs at submit time on the
/// workstation and again on the worker before staging.
pub fn validate_manifest(manifest: &Manifest) -> Result<(), ManifestError> {
    sanitize_segment(&manifest.job_id).map_err(ManifestError::InvalidId)?;
    validate_params(manifest.job_type, &manifest.params)
}

pub fn validate_params(kind: JobKind, params: &JobParams) -> Result<(), ManifestError> {
    sanitize_rel_path(&params.script).map_err(ManifestError::InvalidScript)?;
    sanitize_segment(&params.output_dir).map_err(ManifestError::InvalidOutputDir)?;

    if let Some(characters) = &params.characters {
        if characters.is_empty() {
            return Err(ManifestError::EmptyCharacters);
        }
        for name in characters {
            sanitize_segment(name)
                .map_err(|e| ManifestError::InvalidCharacter(name.clone(), e))?;
        }
    }

    for asset in &params.assets {
        sanitize_rel_path(asset).map_err(|e| ManifestError::InvalidAsset(asset.clone(), e))?;
    }

    // `kind` reserved for recipe-specific requirements beyond the shared
    // ones; both current recipes need exactly script + output_dir.
    let _ = kind;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_params() -> JobParams {
        JobParams {
            script: "r.py".to_string(),
            characters: Some(vec!["X".to_string(), "Y".to_string()]),
            output_dir: "renders".to_string(),
            overrides: None,
            assets: vec!["meshes/base.obj".to_string()],
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn manifest_round_trips() {
        let manifest = Manifest::new(JobKind::Render, sample_params());
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let parsed: Manifest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn manifest_preserves_unknown_fields() {
        let wire = json!({
            "job_id": "render_20260801_101500_ab12cd34",
            "job_type": "render",
            "created_at": "2026-08-01T10:15:00Z",
            "params": {
                "script": "r.py",
                "output_dir": "renders",
                "priority": "low"
            },
            "fleet_hint": "spot"
        });

        let manifest: Manifest = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(manifest.extra["fleet_hint"], json!("spot"));
        assert_eq!(manifest.params.extra["priority"], json!("low"));

        let back = serde_json::to_value(&manifest).unwrap();
        assert_eq!(back["fleet_hint"], wire["fleet_hint"]);
        assert_eq!(back["params"]["priority"], wire["params"]["priority"]);
    }

    #[test]
    fn unknown_kind_is_a_parse_error() {
        let wire = json!({
            "job_id": "x_20260801_101500_ab12cd34",
            "job_type": "sculpt",
            "created_at": "2026-08-01T10:15:00Z",
            "params": {"script": "r.py", "output_dir": "out"}
        });
        assert!(serde_json::from_value::<Manifest>(wire).is_err());
    }

    #[test]
    fn validation_rejects_traversal_output_dir() {
        let mut params = sample_params();
        params.output_dir = "../../etc/passwd".to_string();
        let err = validate_params(JobKind::Render, &params).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidOutputDir(_)));
    }

    #[test]
    fn validation_rejects_bad_character_name() {
        let mut params = sample_params();
        params.characters = Some(vec!["ok".to_string(), "no/slash".to_string()]);
        let err = validate_params(JobKind::Render, &params).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidCharacter(_, _)));
    }

    #[test]
    fn validation_rejects_asset_escape() {
        let mut params = sample_params();
        params.assets = vec!["../../../root/.ssh/id_rsa".to_string()];
        let err = validate_params(JobKind::Render, &params).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidAsset(_, _)));
    }

    #[test]
    fn kind_parses_from_str() {
        assert_eq!("render".parse::<JobKind>().unwrap(), JobKind::Render);
        assert_eq!("character".parse::<JobKind>().unwrap(), JobKind::Character);
        assert!("sculpt".parse::<JobKind>().is_err());
    }
}
