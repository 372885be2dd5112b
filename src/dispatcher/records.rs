//! Workstation-side job history
//!
//! Every submitted manifest is mirrored to `<data_dir>/jobs/<id>.json` at
//! submit time. Records are never rewritten or garbage-collected by the
//! tool; they are the only authoritative history on the workstation and
//! the user deletes them by hand if at all.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::job::Manifest;

pub struct LocalRecords {
    dir: PathBuf,
}

impl LocalRecords {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("jobs"),
        }
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn write(&self, manifest: &Manifest) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let bytes = serde_json::to_vec_pretty(manifest)?;
        fs::write(self.path(&manifest.job_id), bytes)
    }

    /// All recorded manifests, newest first. Unparseable files are
    /// skipped with a warning rather than failing the whole listing.
    pub fn read_all(&self) -> std::io::Result<Vec<Manifest>> {
        let mut manifests = Vec::new();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            match serde_json::from_slice::<Manifest>(&bytes) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job record"),
            }
        }

        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(manifests)
    }
}
