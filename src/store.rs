//! On-disk output layout
//!
//! Everything the pipeline produces lands under `{output_dir}/{task_name}/`:
//!
//! - `commits/` — one JSON record per commit, `{commit, repo}` as retrieved
//!   from the forge, filename flattened from `{full_name}/{sha}` with `/`
//!   replaced by `__`, optionally gzip-compressed (`.gz` suffix)
//! - `sources/{full_name}/{sha}/{filename}` — raw file bytes
//! - `sources/__manifest__{full_name}/{sha}.json` — file manifests for
//!   oversized commits, fetched out-of-band later
//!
//! Writers only ever append new files; directory creation is idempotent, so
//! no further transactional discipline is needed.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::ManifestEntry;

/// Handle to the output tree of one harvesting task
#[derive(Clone, Debug)]
pub struct Store {
    commits_dir: PathBuf,
    sources_dir: PathBuf,
    task_dir: PathBuf,
    gzip: bool,
}

impl Store {
    /// Create the output tree for `task_name` under `root`
    pub fn new(root: &Path, task_name: &str, gzip: bool) -> Result<Self> {
        let task_dir = root.join(task_name);
        let commits_dir = task_dir.join("commits");
        let sources_dir = task_dir.join("sources");
        std::fs::create_dir_all(&commits_dir)?;
        std::fs::create_dir_all(&sources_dir)?;
        Ok(Self {
            commits_dir,
            sources_dir,
            task_dir,
            gzip,
        })
    }

    /// Task-level directory (e.g. for the dedup log)
    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    /// Persist the combined `{commit, repo}` record
    pub async fn write_commit(
        &self,
        repo_full_name: &str,
        sha: &str,
        commit: &Value,
        repo: &Value,
    ) -> Result<PathBuf> {
        let flat = format!("{repo_full_name}/{sha}").replace('/', "__");
        let record = serde_json::json!({ "commit": commit, "repo": repo });
        let body = serde_json::to_vec_pretty(&record)?;

        let path = if self.gzip {
            self.commits_dir.join(format!("{flat}.json.gz"))
        } else {
            self.commits_dir.join(format!("{flat}.json"))
        };
        let data = if self.gzip { gzip_bytes(&body)? } else { body };
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    /// Write the file manifest of an oversized commit
    pub async fn write_manifest(
        &self,
        repo_full_name: &str,
        sha: &str,
        entries: &[ManifestEntry],
    ) -> Result<PathBuf> {
        check_components(repo_full_name)?;
        check_components(sha)?;
        let dir = self.sources_dir.join(format!("__manifest__{repo_full_name}"));
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{sha}.json"));
        tokio::fs::write(&path, serde_json::to_vec_pretty(entries)?).await?;
        Ok(path)
    }

    /// Persist one downloaded source file
    pub async fn write_source(
        &self,
        repo_full_name: &str,
        sha: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        check_components(repo_full_name)?;
        check_components(sha)?;
        check_components(filename)?;

        let path = self
            .sources_dir
            .join(repo_full_name)
            .join(sha)
            .join(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

/// Read a commit record, transparently decompressing `.gz` files
///
/// Used by downstream consumers (profiling, inspection) and by tests; the
/// pipeline itself only writes.
pub fn read_commit(path: &Path) -> Result<Value> {
    let raw = std::fs::read(path)?;
    let body = if path.extension().is_some_and(|ext| ext == "gz") {
        let mut decoder = GzDecoder::new(raw.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        out
    } else {
        raw
    };
    Ok(serde_json::from_slice(&body)?)
}

fn gzip_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Reject path fragments that would escape the store root
fn check_components(fragment: &str) -> Result<()> {
    let path = Path::new(fragment);
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if fragment.is_empty() || !safe {
        return Err(Error::UnsafePath(fragment.to_string()));
    }
    Ok(())
}
