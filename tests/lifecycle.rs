//! End-to-end lifecycle tests: dispatcher and worker cooperating through
//! an in-memory object store, with a stub shell script standing in for
//! the render tool.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use farmhand::config::{DispatcherConfig, WorkerConfig};
use farmhand::dispatcher::{DispatchError, Dispatcher, WaitOutcome};
use farmhand::job::{JobKind, JobParams, JobStatus, Manifest, RENDER_ANGLES};
use farmhand::observability::Metrics;
use farmhand::store::StoreClient;
use farmhand::worker::{FailureCause, JobOutcome, Worker};

/// A fake render tool honoring the argv contract: everything after `--`
/// is `--output DIR [--characters A,B] [--param K=V]...`.
const RENDER_TOOL: &str = r#"
out=""; chars=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    --characters) chars="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "rendering to $out"
for c in $(echo "$chars" | tr ',' ' '); do
  mkdir -p "$out/$c"
  for a in front front_right right back_right back back_left left front_left; do
    echo png-bytes > "$out/$c/$a.png"
  done
done
"#;

struct Harness {
    store: StoreClient,
    dispatcher: Dispatcher,
    worker: Worker,
    dir: TempDir,
    output_dir: std::path::PathBuf,
}

fn setup(tool_body: &str) -> Harness {
    let dir = TempDir::new().unwrap();

    let scripts_dir = dir.path().join("scripts");
    std::fs::create_dir_all(&scripts_dir).unwrap();
    std::fs::write(scripts_dir.join("r.py"), "print('render')\n").unwrap();

    let tool_bin = fake_tool(dir.path(), tool_body);

    let dispatcher_cfg = DispatcherConfig {
        data_dir: dir.path().join("data"),
        scripts_dir,
        output_dir: dir.path().join("output"),
        poll_interval_secs: 1,
        wait_timeout_secs: 30,
    };

    let worker_cfg = WorkerConfig {
        workspace_root: dir.path().join("workspace"),
        poll_interval_secs: 1,
        tool_timeout_secs: 60,
        tool_bin,
        claim_jitter: false,
        ssh_agent_queue: None,
    };

    let store = StoreClient::in_memory();
    let output_dir = dispatcher_cfg.output_dir.clone();
    let dispatcher = Dispatcher::new(store.clone(), dispatcher_cfg, Arc::new(Metrics::new()));
    let worker = Worker::new(store.clone(), worker_cfg, false, Arc::new(Metrics::new()));

    Harness {
        store,
        dispatcher,
        worker,
        dir,
        output_dir,
    }
}

fn fake_tool(dir: &Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-tool");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn render_params() -> JobParams {
    JobParams {
        script: "r.py".to_string(),
        characters: Some(vec!["X".to_string(), "Y".to_string()]),
        output_dir: "renders".to_string(),
        overrides: None,
        assets: Vec::new(),
        extra: BTreeMap::new(),
    }
}

#[tokio::test]
async fn happy_path_submit_execute_download() {
    let h = setup(RENDER_TOOL);

    let id = h
        .dispatcher
        .submit(JobKind::Render, render_params())
        .await
        .unwrap();
    assert_eq!(h.dispatcher.status(&id).await.unwrap(), JobStatus::Pending);

    h.worker.startup().await.unwrap();
    let outcome = h.worker.poll_once().await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::Completed(id.clone())));

    // Completed, and the queue prefixes are clean.
    assert_eq!(h.dispatcher.status(&id).await.unwrap(), JobStatus::Completed);
    assert!(!h.store.exists(&format!("jobs/pending/{id}.json")).await.unwrap());
    assert!(!h.store.exists(&format!("jobs/processing/{id}.json")).await.unwrap());

    // Wait resolves immediately once results exist.
    let outcome = h
        .dispatcher
        .wait(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome, WaitOutcome::Completed);

    // 16 images, one per character per angle, each non-empty.
    let files = h.dispatcher.download(&id, None).await.unwrap();
    let mut count = 0;
    for character in ["X", "Y"] {
        for angle in RENDER_ANGLES {
            let rel = format!("{character}/{angle}.png");
            assert!(files.contains(&rel), "missing {rel}");
            let path = h.output_dir.join(&id).join(&rel);
            assert!(path.metadata().unwrap().len() >= 1);
            count += 1;
        }
    }
    assert_eq!(count, 16);
    assert!(files.contains(&"log.txt".to_string()));

    // The captured tool output made it into the uploaded log.
    let log = std::fs::read_to_string(h.output_dir.join(&id).join("log.txt")).unwrap();
    assert!(log.contains("rendering to"));
}

#[tokio::test]
async fn second_poll_finds_empty_queue() {
    let h = setup(RENDER_TOOL);

    h.dispatcher
        .submit(JobKind::Render, render_params())
        .await
        .unwrap();

    h.worker.startup().await.unwrap();
    assert!(h.worker.poll_once().await.unwrap().is_some());
    assert_eq!(h.worker.poll_once().await.unwrap(), None);
}

#[tokio::test]
async fn unknown_id_stays_unknown() {
    let h = setup(RENDER_TOOL);

    let status = h
        .dispatcher
        .status("nonexistent_20200101_000000_abcdef12")
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Unknown);

    let err = h
        .dispatcher
        .download("nonexistent_20200101_000000_abcdef12", None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotFound(_)));
}

#[tokio::test]
async fn tool_failure_publishes_failure_marker() {
    let h = setup("echo starting; echo boom >&2; exit 1");

    let id = h
        .dispatcher
        .submit(JobKind::Render, render_params())
        .await
        .unwrap();

    h.worker.startup().await.unwrap();
    let outcome = h.worker.poll_once().await.unwrap();
    assert_eq!(
        outcome,
        Some(JobOutcome::Failed(id.clone(), FailureCause::ToolError))
    );

    // Failure is a form of completion: results/ holds the marker and log.
    assert_eq!(h.dispatcher.status(&id).await.unwrap(), JobStatus::Completed);
    assert!(!h.store.exists(&format!("jobs/processing/{id}.json")).await.unwrap());

    let files = h.dispatcher.download(&id, None).await.unwrap();
    assert!(files.contains(&"_FAILED".to_string()));

    let marker = std::fs::read(h.output_dir.join(&id).join("_FAILED")).unwrap();
    let record: serde_json::Value = serde_json::from_slice(&marker).unwrap();
    assert_eq!(record["cause"], "tool_error");

    let log = std::fs::read_to_string(h.output_dir.join(&id).join("log.txt")).unwrap();
    assert!(log.contains("boom"));
}

#[tokio::test]
async fn hung_tool_is_killed_and_recorded() {
    let mut h = setup("sleep 30");
    // Rebuild the worker with a tight timeout.
    let cfg = WorkerConfig {
        workspace_root: h.dir.path().join("workspace"),
        poll_interval_secs: 1,
        tool_timeout_secs: 1,
        tool_bin: fake_tool(h.dir.path(), "sleep 30"),
        claim_jitter: false,
        ssh_agent_queue: None,
    };
    h.worker = Worker::new(h.store.clone(), cfg, false, Arc::new(Metrics::new()));

    let id = h
        .dispatcher
        .submit(JobKind::Render, render_params())
        .await
        .unwrap();

    h.worker.startup().await.unwrap();
    let outcome = h.worker.poll_once().await.unwrap();
    assert_eq!(
        outcome,
        Some(JobOutcome::Failed(id.clone(), FailureCause::Timeout))
    );

    let marker = h.store.get(&format!("results/{id}/_FAILED")).await.unwrap();
    let record: serde_json::Value = serde_json::from_slice(&marker).unwrap();
    assert_eq!(record["cause"], "timeout");
}

#[tokio::test]
async fn missing_asset_fails_without_execution() {
    let h = setup(RENDER_TOOL);

    let mut params = render_params();
    params.assets = vec!["meshes/never_uploaded.obj".to_string()];

    let id = h.dispatcher.submit(JobKind::Render, params).await.unwrap();

    h.worker.startup().await.unwrap();
    let outcome = h.worker.poll_once().await.unwrap();
    assert_eq!(
        outcome,
        Some(JobOutcome::Failed(id.clone(), FailureCause::MissingInput))
    );

    let marker = h.store.get(&format!("results/{id}/_FAILED")).await.unwrap();
    let record: serde_json::Value = serde_json::from_slice(&marker).unwrap();
    assert_eq!(record["cause"], "missing_input");
}

#[tokio::test]
async fn staged_asset_reaches_the_workspace() {
    let h = setup(RENDER_TOOL);
    h.store
        .put("assets/meshes/base.obj", b"obj-bytes".to_vec())
        .await
        .unwrap();

    let mut params = render_params();
    params.assets = vec!["meshes/base.obj".to_string()];

    let id = h.dispatcher.submit(JobKind::Render, params).await.unwrap();

    h.worker.startup().await.unwrap();
    let outcome = h.worker.poll_once().await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::Completed(id)));

    let staged = h.dir.path().join("workspace/assets/meshes/base.obj");
    assert_eq!(std::fs::read(staged).unwrap(), b"obj-bytes");
}

#[tokio::test]
async fn character_job_runs_generic_recipe() {
    let h = setup("out=\"\"\nwhile [ $# -gt 0 ]; do case \"$1\" in --output) out=\"$2\"; shift 2;; *) shift;; esac; done\necho '{}' > \"$out/pose.json\"");

    let params = JobParams {
        script: "r.py".to_string(),
        characters: None,
        output_dir: "poses".to_string(),
        overrides: None,
        assets: Vec::new(),
        extra: BTreeMap::new(),
    };

    let id = h.dispatcher.submit(JobKind::Character, params).await.unwrap();
    assert!(id.starts_with("character_"));

    h.worker.startup().await.unwrap();
    let outcome = h.worker.poll_once().await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::Completed(id.clone())));

    let files = h.dispatcher.download(&id, None).await.unwrap();
    assert!(files.contains(&"pose.json".to_string()));
}

#[tokio::test]
async fn restarted_worker_requeues_and_reruns_stale_job() {
    let h = setup(RENDER_TOOL);

    // Simulate a crash after claiming: manifest sits in processing/ with
    // no worker executing it.
    let manifest = Manifest::new(JobKind::Render, render_params());
    let id = manifest.job_id.clone();
    h.store
        .put(
            &format!("jobs/processing/{id}.json"),
            serde_json::to_vec_pretty(&manifest).unwrap(),
        )
        .await
        .unwrap();

    // Scripts must be on the store; the original submit would have synced
    // them before the crash.
    h.store
        .put("scripts/r.py", b"print('render')\n".to_vec())
        .await
        .unwrap();

    // A restarted worker with a zero timeout treats the manifest as
    // stale; a normal worker then executes it from scratch.
    let stale_cfg = WorkerConfig {
        workspace_root: h.dir.path().join("workspace"),
        poll_interval_secs: 1,
        tool_timeout_secs: 0,
        tool_bin: "/bin/true".to_string(),
        claim_jitter: false,
        ssh_agent_queue: None,
    };
    let recovering = Worker::new(h.store.clone(), stale_cfg, false, Arc::new(Metrics::new()));
    let requeued = recovering.requeue_stale().await.unwrap();
    assert_eq!(requeued, vec![id.clone()]);
    assert_eq!(h.dispatcher.status(&id).await.unwrap(), JobStatus::Pending);

    h.worker.startup().await.unwrap();
    let outcome = h.worker.poll_once().await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::Completed(id.clone())));

    // Exactly one copy of the results, queue prefixes clean.
    assert_eq!(h.dispatcher.status(&id).await.unwrap(), JobStatus::Completed);
    let files = h.dispatcher.download(&id, None).await.unwrap();
    assert_eq!(
        files.iter().filter(|f| f.as_str() == "X/front.png").count(),
        1
    );
}

#[tokio::test]
async fn oldest_job_is_served_first() {
    let h = setup(RENDER_TOOL);

    // Ids embed a second-resolution timestamp; force distinct ordering by
    // submitting two jobs and checking the worker picks the lexically
    // smaller id.
    let first = h
        .dispatcher
        .submit(JobKind::Character, render_params_without_characters())
        .await
        .unwrap();
    let second = h
        .dispatcher
        .submit(JobKind::Render, render_params())
        .await
        .unwrap();

    h.worker.startup().await.unwrap();
    let outcome = h.worker.poll_once().await.unwrap();

    let expected = if first < second { first } else { second };
    assert_eq!(outcome, Some(JobOutcome::Completed(expected)));
}

fn render_params_without_characters() -> JobParams {
    JobParams {
        script: "r.py".to_string(),
        characters: None,
        output_dir: "renders".to_string(),
        overrides: None,
        assets: Vec::new(),
        extra: BTreeMap::new(),
    }
}
