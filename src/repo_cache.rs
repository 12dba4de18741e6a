//! Shared repository clone cache
//!
//! Downstream analysis stages repeatedly need full clones of the same
//! repositories (the same FFmpeg or kernel fix gets revisited for every
//! commit). The cache keeps one clone per cache key on disk and serves
//! consumer checkouts from it, so each repository is cloned over the
//! network exactly once no matter how many consumers ask concurrently:
//! requests for a key with a build already in progress wait for that build
//! instead of starting a second network clone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Clone cache rooted at a single directory, keyed by repository full name
pub struct RepoCache {
    git: PathBuf,
    cache_dir: PathBuf,
    building: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepoCache {
    /// Create a cache rooted at `cache_dir`, locating `git` on the PATH
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let git = which::which("git")
            .map_err(|e| Error::RepoCache(format!("git binary not found: {e}")))?;
        Ok(Self {
            git,
            cache_dir: cache_dir.into(),
            building: Mutex::new(HashMap::new()),
        })
    }

    /// Materialize a full clone of `clone_url` at `dest`
    ///
    /// `full_name` is the cache key. On a cache miss the repository is first
    /// cloned into the cache, then the cache is cloned to `dest`; concurrent
    /// callers with the same key await the in-progress cache build.
    pub async fn fetch_repository_to(
        &self,
        clone_url: &str,
        full_name: &str,
        dest: &Path,
    ) -> Result<()> {
        let cached = self.cache_dir.join(full_name);

        let key_lock = {
            let mut building = self.building.lock().await;
            Arc::clone(
                building
                    .entry(full_name.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        {
            let _build_guard = key_lock.lock().await;
            if !cached.exists() {
                tracing::info!(repo = full_name, "cache miss, cloning into cache");
                if let Some(parent) = cached.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                self.clone_into(clone_url, &cached).await?;
                tracing::info!(repo = full_name, "cache built");
            }
        }

        // Checkouts from the cache may run concurrently
        let cached_str = cached
            .to_str()
            .ok_or_else(|| Error::RepoCache(format!("non-UTF-8 cache path for {full_name}")))?
            .to_string();
        self.clone_into(&cached_str, dest).await
    }

    async fn clone_into(&self, source: &str, dest: &Path) -> Result<()> {
        let status = Command::new(&self.git)
            .arg("clone")
            .arg("--quiet")
            .arg(source)
            .arg(dest)
            .status()
            .await?;
        if !status.success() {
            return Err(Error::RepoCache(format!(
                "git clone of {source} exited with {status}"
            )));
        }
        Ok(())
    }
}
