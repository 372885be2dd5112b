//! Render tool invocation
//!
//! The tool is an opaque subprocess: it reads inputs from the workspace
//! and writes everything under the output directory passed on its command
//! line. The contract is argv-only:
//!
//! ```text
//! <tool> --script <path> -- --output <dir> [--characters a,b] [--param K=V]...
//! ```
//!
//! Exit 0 is success, anything else is failure. Combined stdout+stderr is
//! captured to `logs/<id>.log` for upload alongside the results.

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use super::workspace::Workspace;
use crate::job::Manifest;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch tool: {0}")]
    Spawn(std::io::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcome {
    Success,
    Failed { code: Option<i32> },
    TimedOut,
}

/// Assemble the tool's argument vector from a manifest. The output
/// directory must already exist and be absolute.
pub fn build_args(manifest: &Manifest, workspace: &Workspace, output_dir: &str) -> Vec<String> {
    let script = workspace
        .scripts_dir()
        .join(&manifest.params.script)
        .to_string_lossy()
        .into_owned();

    let mut args = vec![
        "--script".to_string(),
        script,
        "--".to_string(),
        "--output".to_string(),
        output_dir.to_string(),
    ];

    if let Some(characters) = &manifest.params.characters {
        args.push("--characters".to_string());
        args.push(characters.join(","));
    }

    if let Some(overrides) = &manifest.params.overrides {
        for (key, value) in overrides {
            args.push("--param".to_string());
            args.push(format!("{key}={}", scalar(value)));
        }
    }

    args
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Run the tool to completion or timeout. `None` timeout means unbounded
/// (debug mode). On timeout the child is killed; stragglers it spawned
/// are the operator's problem, which is one reason jobs are short.
pub async fn run(
    bin: &str,
    manifest: &Manifest,
    workspace: &Workspace,
    timeout: Option<Duration>,
) -> Result<ToolOutcome> {
    let id = &manifest.job_id;

    let output_dir = workspace.job_output_dir(id);
    std::fs::create_dir_all(&output_dir)?;
    let output_abs = std::fs::canonicalize(&output_dir)?
        .to_string_lossy()
        .into_owned();

    let args = build_args(manifest, workspace, &output_abs);

    let log_file = std::fs::File::create(workspace.log_path(id))?;
    let stderr_file = log_file.try_clone()?;

    info!(job_id = %id, tool = bin, "invoking tool");
    let mut child = Command::new(bin)
        .args(&args)
        .current_dir(workspace.root())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(stderr_file))
        .kill_on_drop(true)
        .spawn()
        .map_err(ToolError::Spawn)?;

    let status = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(job_id = %id, timeout_secs = limit.as_secs(), "tool timed out, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Ok(ToolOutcome::TimedOut);
            }
        },
        None => child.wait().await?,
    };

    if status.success() {
        Ok(ToolOutcome::Success)
    } else {
        Ok(ToolOutcome::Failed {
            code: status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, JobParams};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn manifest_with(overrides: Option<BTreeMap<String, Value>>) -> Manifest {
        Manifest::new(
            JobKind::Render,
            JobParams {
                script: "r.py".to_string(),
                characters: Some(vec!["X".to_string(), "Y".to_string()]),
                output_dir: "renders".to_string(),
                overrides,
                assets: Vec::new(),
                extra: BTreeMap::new(),
            },
        )
    }

    #[cfg(unix)]
    fn fake_tool(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-tool");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn args_follow_the_invocation_contract() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf());

        let mut overrides = BTreeMap::new();
        overrides.insert("samples".to_string(), Value::from(64));
        overrides.insert("style".to_string(), Value::from("clay"));

        let manifest = manifest_with(Some(overrides));
        let args = build_args(&manifest, &ws, "/abs/out");

        let script = ws.scripts_dir().join("r.py").to_string_lossy().into_owned();
        assert_eq!(
            args,
            vec![
                "--script".to_string(),
                script,
                "--".to_string(),
                "--output".to_string(),
                "/abs/out".to_string(),
                "--characters".to_string(),
                "X,Y".to_string(),
                "--param".to_string(),
                "samples=64".to_string(),
                "--param".to_string(),
                "style=clay".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_tool_reports_success_and_captures_log() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf());
        ws.ensure_layout().unwrap();

        let tool = fake_tool(dir.path(), "echo rendering; echo oops >&2; exit 0");
        let manifest = manifest_with(None);

        let outcome = run(&tool, &manifest, &ws, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(outcome, ToolOutcome::Success);

        let log = std::fs::read_to_string(ws.log_path(&manifest.job_id)).unwrap();
        assert!(log.contains("rendering"));
        assert!(log.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_tool_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf());
        ws.ensure_layout().unwrap();

        let tool = fake_tool(dir.path(), "exit 3");
        let manifest = manifest_with(None);

        let outcome = run(&tool, &manifest, &ws, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(outcome, ToolOutcome::Failed { code: Some(3) });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_tool_times_out() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf());
        ws.ensure_layout().unwrap();

        let tool = fake_tool(dir.path(), "sleep 30");
        let manifest = manifest_with(None);

        let outcome = run(&tool, &manifest, &ws, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(outcome, ToolOutcome::TimedOut);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf());
        ws.ensure_layout().unwrap();

        let manifest = manifest_with(None);
        let err = run(
            "/nonexistent/render-tool",
            &manifest,
            &ws,
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Spawn(_)));
    }
}
