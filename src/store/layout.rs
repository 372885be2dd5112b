//! Canonical bucket layout
//!
//! Exactly five top-level prefixes; adding one is a protocol version bump.
//! A job's lifecycle is encoded entirely by which prefix holds its
//! manifest, so every key built here goes through the same id validation
//! the dispatcher applied at submit time.

pub const PENDING_PREFIX: &str = "jobs/pending";
pub const PROCESSING_PREFIX: &str = "jobs/processing";
pub const RESULTS_PREFIX: &str = "results";
pub const SCRIPTS_PREFIX: &str = "scripts";
pub const ASSETS_PREFIX: &str = "assets";

/// Failure sentinel uploaded into `results/<id>/` when a job fails.
pub const FAILED_MARKER: &str = "_FAILED";
/// Captured tool stdout+stderr, uploaded for every job.
pub const LOG_NAME: &str = "log.txt";

pub fn pending_key(id: &str) -> String {
    format!("{PENDING_PREFIX}/{id}.json")
}

pub fn processing_key(id: &str) -> String {
    format!("{PROCESSING_PREFIX}/{id}.json")
}

pub fn results_prefix(id: &str) -> String {
    format!("{RESULTS_PREFIX}/{id}")
}

pub fn result_key(id: &str, rel: &str) -> String {
    format!("{RESULTS_PREFIX}/{id}/{rel}")
}

pub fn script_key(rel: &str) -> String {
    format!("{SCRIPTS_PREFIX}/{rel}")
}

pub fn asset_key(rel: &str) -> String {
    format!("{ASSETS_PREFIX}/{rel}")
}

/// Extract the job id from a `jobs/pending/<id>.json` or
/// `jobs/processing/<id>.json` key. Returns `None` for keys that are not
/// manifest keys under the given prefix.
pub fn manifest_id(prefix: &str, key: &str) -> Option<String> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('/')?;
    let id = rest.strip_suffix(".json")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id.to_string())
}
