//! Worker-side workspace
//!
//! Fixed directory tree under the workspace root:
//!
//! ```text
//! assets/            staged store assets, cached across jobs
//! scripts/           staged store scripts, cached across jobs
//! output/<id>/       per-job tool output, uploaded then removed
//! jobs/pending/      manifest downloaded during a claim attempt
//! jobs/processing/   manifest of the job currently (or last) executed
//! logs/<id>.log      combined tool stdout+stderr, uploaded then removed
//! ```
//!
//! Only `assets/` and `scripts/` survive a job; everything else is
//! per-job state owned exclusively by this worker process.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::job::Manifest;

pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.assets_dir(),
            self.scripts_dir(),
            self.output_dir(),
            self.pending_dir(),
            self.processing_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.root.join("assets")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn job_output_dir(&self, id: &str) -> PathBuf {
        self.output_dir().join(id)
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("jobs").join("pending")
    }

    pub fn processing_dir(&self) -> PathBuf {
        self.root.join("jobs").join("processing")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.logs_dir().join(format!("{id}.log"))
    }

    /// Record a claimed manifest locally: written under `jobs/pending/`
    /// first, renamed into `jobs/processing/` once the store-side move
    /// has succeeded, mirroring the store transition.
    pub fn record_claim(&self, manifest: &Manifest) -> std::io::Result<()> {
        let name = format!("{}.json", manifest.job_id);
        let pending = self.pending_dir().join(&name);
        let processing = self.processing_dir().join(&name);
        let bytes = serde_json::to_vec_pretty(manifest)?;
        fs::write(&pending, bytes)?;
        fs::rename(&pending, &processing)?;
        debug!(job_id = %manifest.job_id, "claim recorded in workspace");
        Ok(())
    }

    /// Remove per-job state after the job's outcome is published. Cached
    /// assets and scripts are untouched.
    pub fn clear_job(&self, id: &str) -> std::io::Result<()> {
        let output = self.job_output_dir(id);
        if output.exists() {
            fs::remove_dir_all(&output)?;
        }
        let log = self.log_path(id);
        if log.exists() {
            fs::remove_file(&log)?;
        }
        Ok(())
    }

    /// Drop local job manifests older than the cutoff. Returns how many
    /// were removed.
    pub fn prune_job_records(&self, max_age: Duration) -> std::io::Result<usize> {
        let mut removed = 0;
        for dir in [self.pending_dir(), self.processing_dir()] {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            for entry in entries {
                let entry = entry?;
                let modified = entry.metadata()?.modified()?;
                let age = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO);
                if age > max_age {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!(path = %entry.path().display(), error = %e, "failed to prune job record");
                    } else {
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}
