//! Workstation-side dispatcher
//!
//! Translates client intent into store state and never blocks on job
//! execution. Submit's manifest upload is the commit point: a job either
//! appears complete in `jobs/pending/` or not at all. Status is a pure
//! probe of store contents; the probe order (results, processing,
//! pending) is load-bearing for race correctness and must not change.

mod records;

pub use records::LocalRecords;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::DispatcherConfig;
use crate::job::{self, JobKind, JobParams, JobStatus, Manifest};
use crate::observability::Metrics;
use crate::store::{StoreClient, StoreError, layout};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => DispatchError::NotFound(key),
            other => DispatchError::Transport(other.to_string()),
        }
    }
}

impl From<job::ManifestError> for DispatchError {
    fn from(err: job::ManifestError) -> Self {
        DispatchError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::Internal(err.to_string())
    }
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
}

pub struct Dispatcher {
    store: StoreClient,
    cfg: DispatcherConfig,
    records: LocalRecords,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(store: StoreClient, cfg: DispatcherConfig, metrics: Arc<Metrics>) -> Self {
        let records = LocalRecords::new(&cfg.data_dir);
        Self {
            store,
            cfg,
            records,
            metrics,
        }
    }

    /// Submit a job: validate, sync scripts, upload the manifest, record
    /// locally. Returns the generated job id.
    ///
    /// Failure before the manifest upload leaves at most an updated
    /// `scripts/` mirror behind, which is idempotent and harmless — no
    /// worker ever sees a half-submitted job.
    pub async fn submit(&self, kind: JobKind, params: JobParams) -> Result<String> {
        job::validate_params(kind, &params)?;

        let script_path = self.cfg.scripts_dir.join(&params.script);
        if !script_path.is_file() {
            return Err(DispatchError::Validation(format!(
                "script not found locally: {}",
                script_path.display()
            )));
        }

        let manifest = Manifest::new(kind, params);
        let id = manifest.job_id.clone();

        self.store
            .mirror(&self.cfg.scripts_dir, layout::SCRIPTS_PREFIX)
            .await?;

        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        self.store.put(&layout::pending_key(&id), bytes).await?;

        self.records.write(&manifest)?;
        self.metrics.job_submitted();
        info!(job_id = %id, kind = %kind, "job submitted");

        Ok(id)
    }

    /// Derived status of a job. Ids that fail sanitization resolve to
    /// `Unknown` without touching the store.
    pub async fn status(&self, id: &str) -> Result<JobStatus> {
        if job::sanitize_segment(id).is_err() {
            return Ok(JobStatus::Unknown);
        }

        if self
            .store
            .first_key(&layout::results_prefix(id))
            .await?
            .is_some()
        {
            return Ok(JobStatus::Completed);
        }
        if self.store.exists(&layout::processing_key(id)).await? {
            return Ok(JobStatus::Processing);
        }
        if self.store.exists(&layout::pending_key(id)).await? {
            return Ok(JobStatus::Pending);
        }

        Ok(JobStatus::Unknown)
    }

    /// Poll status until the job completes or the timeout elapses.
    /// Cancelling the caller cancels the wait but never the job.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<WaitOutcome> {
        let started = tokio::time::Instant::now();
        let interval = Duration::from_secs(self.cfg.poll_interval_secs);

        loop {
            if self.status(id).await? == JobStatus::Completed {
                return Ok(WaitOutcome::Completed);
            }
            if started.elapsed() >= timeout {
                return Ok(WaitOutcome::TimedOut);
            }
            tokio::time::sleep(interval.min(timeout.saturating_sub(started.elapsed()))).await;
        }
    }

    /// Mirror `results/<id>/` into `<dest>/<id>/`, overwriting on
    /// conflict. Returns the relative paths of the result files.
    ///
    /// If the worker is still publishing (its processing manifest has not
    /// been deleted yet), the results listing is re-read until it is
    /// stable for one poll interval before the mirror runs.
    pub async fn download(&self, id: &str, dest: Option<&Path>) -> Result<Vec<String>> {
        job::sanitize_segment(id).map_err(|e| DispatchError::Validation(e.to_string()))?;

        let prefix = layout::results_prefix(id);
        if self.store.first_key(&prefix).await?.is_none() {
            return Err(DispatchError::NotFound(format!("no results for job {id}")));
        }

        if self.store.exists(&layout::processing_key(id)).await? {
            let settle = Duration::from_secs(self.cfg.poll_interval_secs);
            let mut previous = self.store.list(&prefix).await?;
            loop {
                warn!(job_id = %id, "results still being published, waiting for listing to settle");
                tokio::time::sleep(settle).await;
                let current = self.store.list(&prefix).await?;
                if current == previous {
                    break;
                }
                previous = current;
            }
        }

        let target = dest.unwrap_or(&self.cfg.output_dir).join(id);
        let files = self.store.pull(&prefix, &target).await?;
        info!(job_id = %id, files = files.len(), dest = %target.display(), "results downloaded");
        Ok(files)
    }

    /// All locally recorded manifests, newest first.
    pub fn list(&self) -> Result<Vec<Manifest>> {
        Ok(self.records.read_all()?)
    }

    /// Maintenance: move `processing/` manifests older than the cutoff
    /// back to `pending/`. Never runs automatically — a poisoned job plus
    /// duplicate-execution tolerance would otherwise burn GPU time
    /// without bound.
    pub async fn reap(&self, older_than: Duration) -> Result<Vec<String>> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| DispatchError::Validation(e.to_string()))?;

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

            match self
                .store
                .move_object(&key, &layout::pending_key(&id))
                .await?
            {
                crate::store::MoveOutcome::Moved => {
                    info!(job_id = %id, "stale processing manifest requeued");
                    requeued.push(id);
                }
                crate::store::MoveOutcome::SourceMissing => {}
            }
        }

        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::layout;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn test_dispatcher(scripts: &[(&str, &str)]) -> (Dispatcher, StoreClient, TempDir) {
        let dir = TempDir::new().unwrap();
        let scripts_dir = dir.path().join("scripts");
        std::fs::create_dir_all(&scripts_dir).unwrap();
        for (name, body) in scripts {
            let path = scripts_dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, body).unwrap();
        }

        let cfg = DispatcherConfig {
            data_dir: dir.path().join("data"),
            scripts_dir,
            output_dir: dir.path().join("output"),
            poll_interval_secs: 1,
            wait_timeout_secs: 5,
        };

        let store = StoreClient::in_memory();
        let dispatcher = Dispatcher::new(store.clone(), cfg, Arc::new(Metrics::new()));
        (dispatcher, store, dir)
    }

    fn render_params(script: &str) -> JobParams {
        JobParams {
            script: script.to_string(),
            characters: Some(vec!["X".to_string()]),
            output_dir: "renders".to_string(),
            overrides: None,
            assets: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn submit_uploads_manifest_and_scripts() {
        let (dispatcher, store, _dir) = test_dispatcher(&[("r.py", "print(1)")]);

        let id = dispatcher
            .submit(JobKind::Render, render_params("r.py"))
            .await
            .unwrap();

        assert!(store.exists(&layout::pending_key(&id)).await.unwrap());
        assert!(store.exists("scripts/r.py").await.unwrap());
        assert_eq!(dispatcher.status(&id).await.unwrap(), JobStatus::Pending);
        assert_eq!(dispatcher.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn submit_rejects_traversal_without_store_mutation() {
        let (dispatcher, store, _dir) = test_dispatcher(&[("r.py", "print(1)")]);

        let mut params = render_params("r.py");
        params.output_dir = "../../etc/passwd".to_string();

        let err = dispatcher.submit(JobKind::Render, params).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_rejects_missing_local_script() {
        let (dispatcher, _store, _dir) = test_dispatcher(&[("r.py", "print(1)")]);

        let err = dispatcher
            .submit(JobKind::Render, render_params("ghost.py"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn status_probe_order_prefers_results() {
        let (dispatcher, store, _dir) = test_dispatcher(&[]);

        // Worst race: results written but processing not yet deleted.
        store
            .put("results/j1/log.txt", b"done".to_vec())
            .await
            .unwrap();
        store
            .put(&layout::processing_key("j1"), b"{}".to_vec())
            .await
            .unwrap();

        assert_eq!(dispatcher.status("j1").await.unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn status_of_invalid_id_is_unknown() {
        let (dispatcher, _store, _dir) = test_dispatcher(&[]);
        assert_eq!(
            dispatcher.status("../../etc/passwd").await.unwrap(),
            JobStatus::Unknown
        );
        assert_eq!(
            dispatcher.status("never_submitted").await.unwrap(),
            JobStatus::Unknown
        );
    }

    #[tokio::test]
    async fn download_unknown_id_is_not_found() {
        let (dispatcher, _store, _dir) = test_dispatcher(&[]);
        let err = dispatcher
            .download("nonexistent_20200101_000000_abcdef12", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[tokio::test]
    async fn download_mirrors_results() {
        let (dispatcher, store, dir) = test_dispatcher(&[]);
        store
            .put("results/j1/X/front.png", vec![0xff])
            .await
            .unwrap();

        let files = dispatcher.download("j1", None).await.unwrap();
        assert_eq!(files, vec!["X/front.png".to_string()]);
        assert!(dir.path().join("output/j1/X/front.png").is_file());
    }

    #[tokio::test]
    async fn download_settles_while_publish_is_in_flight() {
        let (dispatcher, store, dir) = test_dispatcher(&[]);

        // Worker mid-publish: results partially uploaded, processing
        // manifest still present.
        store
            .put("results/j1/X/front.png", vec![1])
            .await
            .unwrap();
        store
            .put(&layout::processing_key("j1"), b"{}".to_vec())
            .await
            .unwrap();

        let files = dispatcher.download("j1", None).await.unwrap();
        assert!(files.contains(&"X/front.png".to_string()));
        assert!(dir.path().join("output/j1/X/front.png").is_file());
    }

    #[tokio::test]
    async fn wait_times_out() {
        let (dispatcher, _store, _dir) = test_dispatcher(&[]);
        let outcome = dispatcher
            .wait("never_done", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn wait_sees_completion() {
        let (dispatcher, store, _dir) = test_dispatcher(&[]);
        store.put("results/j1/log.txt", b"ok".to_vec()).await.unwrap();

        let outcome = dispatcher.wait("j1", Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Completed);
    }

    #[tokio::test]
    async fn reap_requeues_stale_processing() {
        let (dispatcher, store, _dir) = test_dispatcher(&[]);
        store
            .put(&layout::processing_key("j1"), b"{}".to_vec())
            .await
            .unwrap();

        let requeued = dispatcher.reap(Duration::ZERO).await.unwrap();
        assert_eq!(requeued, vec!["j1".to_string()]);
        assert!(store.exists(&layout::pending_key("j1")).await.unwrap());
        assert!(!store.exists(&layout::processing_key("j1")).await.unwrap());
    }

    #[tokio::test]
    async fn reap_leaves_fresh_processing_alone() {
        let (dispatcher, store, _dir) = test_dispatcher(&[]);
        store
            .put(&layout::processing_key("j1"), b"{}".to_vec())
            .await
            .unwrap();

        let requeued = dispatcher.reap(Duration::from_secs(3600)).await.unwrap();
        assert!(requeued.is_empty());
        assert!(store.exists(&layout::processing_key("j1")).await.unwrap());
    }
}
