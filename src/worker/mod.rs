//! GPU-host worker agent
//!
//! A single serial loop that drains `jobs/pending/` one job at a time:
//!
//! ```text
//!   idle ──(pending found)──▶ claiming
//!   claiming ──(move ok)──▶ staging
//!   claiming ──(move fails: already moved)──▶ idle
//!   staging ──(inputs ready)──▶ executing
//!   executing ──(tool exit 0)──▶ publishing
//!   executing ──(tool exit ≠0 or timeout)──▶ failing
//!   publishing ──(upload ok)──▶ cleanup
//!   failing ──(failure record uploaded)──▶ cleanup
//!   cleanup ──(processing manifest deleted)──▶ idle
//! ```
//!
//! At most one job is in flight per worker process: GPU memory and tool
//! licensing do not admit parallelism, and serialization is what keeps
//! the claim protocol correct. Two workers may still both claim the same
//! job during the copy-then-delete window; that duplicate execution is
//! tolerated because manifests are immutable and the results upload is
//! last-writer-wins.

pub mod tool;
pub mod workspace;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::job::{self, Manifest};
use crate::observability::Metrics;
use crate::store::{MoveOutcome, StoreClient, StoreError, layout};

use tool::ToolOutcome;
use workspace::Workspace;

/// Local job manifests are dropped after this long.
const JOB_RECORD_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workspace io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Why a job failed, as recorded in its `_FAILED` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    MissingInput,
    ToolError,
    Timeout,
    Internal,
}

impl FailureCause {
    pub fn code(&self) -> &'static str {
        match self {
            FailureCause::MissingInput => "missing_input",
            FailureCause::ToolError => "tool_error",
            FailureCause::Timeout => "timeout",
            FailureCause::Internal => "internal",
        }
    }
}

/// Body of the `_FAILED` sentinel object.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailureRecord {
    pub cause: String,
    pub message: String,
}

/// What one pass over the pending queue did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(String),
    Failed(String, FailureCause),
    LostClaim(String),
}

enum StageFailure {
    MissingInput(String),
    Store(StoreError),
}

pub struct Worker {
    store: StoreClient,
    cfg: WorkerConfig,
    workspace: Workspace,
    metrics: Arc<Metrics>,
    debug: bool,
}

impl Worker {
    pub fn new(store: StoreClient, cfg: WorkerConfig, debug: bool, metrics: Arc<Metrics>) -> Self {
        let workspace = Workspace::new(cfg.workspace_root.clone());
        Self {
            store,
            cfg,
            workspace,
            metrics,
            debug,
        }
    }

    /// Run forever: startup recovery, then poll / execute / sleep.
    pub async fn run(&self) -> Result<()> {
        self.startup().await?;

        let interval = Duration::from_secs(self.cfg.poll_interval_secs);
        loop {
            match self.poll_once().await {
                Ok(Some(outcome)) => {
                    info!(?outcome, "job pass finished");
                    // Keep draining without sleeping while work remains.
                }
                Ok(None) => tokio::time::sleep(interval).await,
                Err(e) => {
                    // Transient failure: the manifest stays in
                    // processing/ and a later pass or restart retries.
                    warn!(error = %e, "worker pass failed, backing off");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    /// One-time startup work: workspace layout, crash recovery, ready
    /// notification.
    pub async fn startup(&self) -> Result<()> {
        self.workspace.ensure_layout()?;

        let requeued = self.requeue_stale().await?;
        if !requeued.is_empty() {
            info!(count = requeued.len(), "requeued stale processing manifests");
        }

        self.notify_ready();
        info!(workspace = %self.workspace.root().display(), "worker ready");
        Ok(())
    }

    /// Crash recovery: a `processing/` manifest older than the tool
    /// timeout cannot still be executing, so it is moved back to
    /// `pending/` and re-run from scratch.
    pub async fn requeue_stale(&self) -> Result<Vec<String>> {
        let cutoff =
            chrono::Utc::now() - chrono::Duration::seconds(self.cfg.tool_timeout_secs as i64);

        let mut requeued = Vec::new();
        for key in self.store.list(layout::PROCESSING_PREFIX).await? {
            let Some(id) = layout::manifest_id(layout::PROCESSING_PREFIX, &key) else {
                continue;
            };
            let modified = match self.store.modified_at(&key).await {
                Ok(ts) => ts,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if modified >= cutoff {
                continue;
            }

            if self
                .store
                .move_object(&key, &layout::pending_key(&id))
                .await?
                == MoveOutcome::Moved
            {
                warn!(job_id = %id, "stale processing manifest requeued for re-execution");
                requeued.push(id);
            }
        }
        Ok(requeued)
    }

    /// One pass: claim the oldest pending job, execute it to completion
    /// or recorded failure. `None` means the queue was empty.
    pub async fn poll_once(&self) -> Result<Option<JobOutcome>> {
        let keys = self.store.list(layout::PENDING_PREFIX).await?;
        let mut ids: Vec<String> = keys
            .iter()
            .filter_map(|key| layout::manifest_id(layout::PENDING_PREFIX, key))
            .filter(|id| {
                let ok = job::sanitize_segment(id).is_ok();
                if !ok {
                    warn!(job_id = %id, "ignoring pending manifest with unsafe id");
                }
                ok
            })
            .collect();
        ids.sort();

        let Some(id) = ids.into_iter().next() else {
            return Ok(None);
        };

        // Multi-worker deployments spread claim attempts out so that two
        // workers observing the same listing rarely race.
        if self.cfg.claim_jitter {
            let max_ms = self.cfg.poll_interval_secs.saturating_mul(1000).max(1);
            let jitter = rand::rng().random_range(0..max_ms);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let pending_key = layout::pending_key(&id);
        let bytes = match self.store.get(&pending_key).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return Ok(Some(JobOutcome::LostClaim(id))),
            Err(e) => return Err(e.into()),
        };

        let manifest = match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(manifest) if manifest.job_id == id && job::validate_manifest(&manifest).is_ok() => {
                manifest
            }
            Ok(manifest) => {
                error!(job_id = %id, manifest_id = %manifest.job_id, "manifest fails validation or id mismatch");
                return self.quarantine(&id, "manifest fails validation").await;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "unparseable manifest in pending");
                return self.quarantine(&id, "unparseable manifest").await;
            }
        };

        match self
            .store
            .move_object(&pending_key, &layout::processing_key(&id))
            .await?
        {
            MoveOutcome::Moved => {}
            MoveOutcome::SourceMissing => {
                info!(job_id = %id, "another worker claimed this job");
                return Ok(Some(JobOutcome::LostClaim(id)));
            }
        }
        self.metrics.job_claimed();
        self.workspace.record_claim(&manifest)?;
        info!(job_id = %id, kind = %manifest.job_type, "job claimed");

        match self.stage(&manifest).await {
            Ok(()) => {}
            Err(StageFailure::MissingInput(message)) => {
                return self
                    .fail_job(&id, FailureCause::MissingInput, &message)
                    .await;
            }
            Err(StageFailure::Store(e)) => return Err(e.into()),
        }

        let timeout = if self.debug {
            None
        } else {
            Some(Duration::from_secs(self.cfg.tool_timeout_secs))
        };

        match tool::run(&self.cfg.tool_bin, &manifest, &self.workspace, timeout).await {
            Ok(ToolOutcome::Success) => {
                self.publish_success(&id).await?;
                self.cleanup(&id).await?;
                self.metrics.job_completed();
                info!(job_id = %id, "job completed");
                Ok(Some(JobOutcome::Completed(id)))
            }
            Ok(ToolOutcome::Failed { code }) => {
                let message = match code {
                    Some(code) => format!("tool exited with status {code}"),
                    None => "tool killed by signal".to_string(),
                };
                self.fail_job(&id, FailureCause::ToolError, &message).await
            }
            Ok(ToolOutcome::TimedOut) => {
                let message =
                    format!("tool exceeded timeout of {}s", self.cfg.tool_timeout_secs);
                self.fail_job(&id, FailureCause::Timeout, &message).await
            }
            Err(tool::ToolError::Spawn(e)) => {
                let message = format!("failed to launch {}: {e}", self.cfg.tool_bin);
                self.fail_job(&id, FailureCause::ToolError, &message).await
            }
            Err(tool::ToolError::Io(e)) => Err(e.into()),
        }
    }

    /// Stage inputs: mirror the script tree, pull each referenced asset.
    /// A script or asset absent from the store is a permanent failure for
    /// this job, not a transport error.
    async fn stage(&self, manifest: &Manifest) -> std::result::Result<(), StageFailure> {
        self.store
            .pull(layout::SCRIPTS_PREFIX, &self.workspace.scripts_dir())
            .await
            .map_err(StageFailure::Store)?;

        let script_path = self.workspace.scripts_dir().join(&manifest.params.script);
        if !script_path.is_file() {
            return Err(StageFailure::MissingInput(format!(
                "script not on store: {}",
                manifest.params.script
            )));
        }

        for asset in &manifest.params.assets {
            let key = layout::asset_key(asset);
            let dest = self.workspace.assets_dir().join(asset);

            let cached = dest.is_file();
            match self.store.get(&key).await {
                Ok(data) => {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            StageFailure::Store(StoreError::Io(e))
                        })?;
                    }
                    std::fs::write(&dest, data)
                        .map_err(|e| StageFailure::Store(StoreError::Io(e)))?;
                }
                Err(StoreError::NotFound(_)) if cached => {
                    // Asset pruned from the store but still cached
                    // locally; the cached copy is authoritative enough.
                }
                Err(StoreError::NotFound(_)) => {
                    return Err(StageFailure::MissingInput(format!(
                        "asset not on store: {asset}"
                    )));
                }
                Err(e) => return Err(StageFailure::Store(e)),
            }
        }

        std::fs::create_dir_all(self.workspace.job_output_dir(&manifest.job_id))
            .map_err(|e| StageFailure::Store(StoreError::Io(e)))?;

        Ok(())
    }

    /// Upload the output tree, then the log. The processing manifest is
    /// only deleted afterwards (in cleanup), so a status probe can never
    /// see the job vanish before its results exist.
    async fn publish_success(&self, id: &str) -> Result<()> {
        let output = self.workspace.job_output_dir(id);
        self.store.mirror(&output, &layout::results_prefix(id)).await?;
        self.upload_log(id).await?;
        Ok(())
    }

    async fn publish_failure(&self, id: &str, cause: FailureCause, message: &str) -> Result<()> {
        self.upload_log(id).await?;

        let record = FailureRecord {
            cause: cause.code().to_string(),
            message: message.to_string(),
        };
        let bytes = serde_json::to_vec(&record).unwrap_or_default();
        self.store
            .put(&layout::result_key(id, layout::FAILED_MARKER), bytes)
            .await?;
        Ok(())
    }

    async fn upload_log(&self, id: &str) -> Result<()> {
        let log = std::fs::read(self.workspace.log_path(id)).unwrap_or_default();
        self.store
            .put(&layout::result_key(id, layout::LOG_NAME), log)
            .await?;
        Ok(())
    }

    /// Delete the processing manifest and per-job local state. Runs only
    /// after the outcome (results or failure record) is fully uploaded.
    async fn cleanup(&self, id: &str) -> Result<()> {
        match self.store.delete(&layout::processing_key(id)).await {
            Ok(()) => {}
            // A duplicate claimant may have finished first.
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.workspace.clear_job(id)?;
        self.workspace.prune_job_records(JOB_RECORD_TTL)?;
        Ok(())
    }

    async fn fail_job(
        &self,
        id: &str,
        cause: FailureCause,
        message: &str,
    ) -> Result<Option<JobOutcome>> {
        error!(job_id = %id, cause = cause.code(), message, "job failed");
        self.publish_failure(id, cause, message).await?;
        self.cleanup(id).await?;
        self.metrics.job_failed();
        Ok(Some(JobOutcome::Failed(id.to_string(), cause)))
    }

    /// A malformed pending manifest violates the submit-time invariants.
    /// Park it in processing/ and record the failure so it stops clogging
    /// the front of the queue.
    async fn quarantine(&self, id: &str, message: &str) -> Result<Option<JobOutcome>> {
        match self
            .store
            .move_object(&layout::pending_key(id), &layout::processing_key(id))
            .await?
        {
            MoveOutcome::Moved => {}
            MoveOutcome::SourceMissing => return Ok(Some(JobOutcome::LostClaim(id.to_string()))),
        }
        self.publish_failure(id, FailureCause::Internal, message).await?;
        match self.store.delete(&layout::processing_key(id)).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.metrics.job_failed();
        Ok(Some(JobOutcome::Failed(id.to_string(), FailureCause::Internal)))
    }

    /// Best-effort out-of-band "worker is up" line for setup tooling.
    fn notify_ready(&self) {
        let Some(path) = &self.cfg.ssh_agent_queue else {
            return;
        };
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        let line = format!(
            "farmhand-worker ready host={host} workspace={} at={}\n",
            self.workspace.root().display(),
            chrono::Utc::now().to_rfc3339()
        );
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to write ready notification");
        }
    }
}
