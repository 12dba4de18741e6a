//! Core types shared across the pipeline
//!
//! Request descriptors and tasks for the fetch engine, queue statistics used
//! by admission predicates, and the typed projections of the forge API
//! payloads the pipeline consumes. Payload types are projections: the commit
//! store persists the raw JSON bodies, so these structs only declare the
//! fields the pipeline itself reads and tolerate everything else.

use serde::{Deserialize, Serialize};

/// Credentials attached to API requests (forge token as basic-auth username)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// Basic-auth username (the API token)
    pub username: String,
    /// Basic-auth password (empty for token auth)
    pub password: String,
}

impl Credentials {
    /// Token-style credentials: token as username, empty password
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            username: token.into(),
            password: String::new(),
        }
    }
}

/// Description of a single HTTP request to perform
///
/// Only GET requests exist in this pipeline, so the descriptor carries no
/// method field. Query parameters are kept separate from the URL so retried
/// and paginated requests can be logged meaningfully.
#[derive(Clone, Debug, Default)]
pub struct RequestDescriptor {
    /// Target URL (may already contain a query string, e.g. pagination links)
    pub url: String,
    /// Extra query parameters appended to the URL
    pub query: Vec<(String, String)>,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    /// Optional credentials
    pub auth: Option<Credentials>,
}

impl RequestDescriptor {
    /// Create a descriptor for a GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Append a query parameter
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Append a request header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach credentials
    #[must_use]
    pub fn with_auth(mut self, auth: Option<Credentials>) -> Self {
        self.auth = auth;
        self
    }
}

/// A unit of work queued on a fetcher
///
/// `continuation` is opaque to the engine: it is handed back unchanged with
/// the completion so the next stage knows which commit/repo/file the
/// response belongs to.
#[derive(Clone, Debug)]
pub struct Task<C> {
    /// Number of failed attempts so far
    pub trial: u32,
    /// The request to perform
    pub request: RequestDescriptor,
    /// Opaque data returned with the completion
    pub continuation: C,
}

/// Snapshot of a fetcher's queue counters
///
/// `pending` counts queued tasks plus the in-flight request, so sibling
/// fetchers can use it directly in admission predicates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks waiting in the queue plus the request currently in flight
    pub pending: usize,
    /// Successfully completed requests
    pub finished: usize,
    /// Failed attempts (each retry that fails counts once)
    pub errored: usize,
}

// ---------------------------------------------------------------------------
// Forge API payload projections
// ---------------------------------------------------------------------------

/// One page of commit search results
#[derive(Clone, Debug, Deserialize)]
pub struct SearchResults {
    /// Total number of results the query matched
    #[serde(default)]
    pub total_count: u64,
    /// Result items on this page
    #[serde(default)]
    pub items: Vec<SearchItem>,
}

/// A single commit search result
#[derive(Clone, Debug, Deserialize)]
pub struct SearchItem {
    /// Commit SHA
    pub sha: String,
    /// Commit detail API URL
    pub url: String,
    /// Owning repository
    pub repository: RepoRef,
}

/// Minimal repository reference embedded in search results
#[derive(Clone, Debug, Deserialize)]
pub struct RepoRef {
    /// `owner/name`
    pub full_name: String,
}

/// Commit detail payload
#[derive(Clone, Debug, Deserialize)]
pub struct Commit {
    /// Commit SHA
    pub sha: String,
    /// Commit detail API URL
    pub url: String,
    /// Git-level commit metadata
    pub commit: CommitMeta,
    /// Aggregate change statistics
    #[serde(default)]
    pub stats: Option<CommitStats>,
    /// Parent commits (first parent is the diff base)
    #[serde(default)]
    pub parents: Vec<CommitParent>,
    /// Files changed by this commit
    #[serde(default)]
    pub files: Vec<CommitFile>,
}

/// Git-level commit metadata (author, message)
#[derive(Clone, Debug, Deserialize)]
pub struct CommitMeta {
    /// Git commit object URL (`.../git/commits/<sha>`)
    pub url: String,
    /// Author identity and date
    pub author: CommitAuthor,
    /// Full commit message
    #[serde(default)]
    pub message: String,
}

/// Commit author identity
#[derive(Clone, Debug, Deserialize)]
pub struct CommitAuthor {
    /// Author date, RFC 3339
    #[serde(default)]
    pub date: String,
}

/// Aggregate line-change statistics for a commit
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct CommitStats {
    /// Lines added
    #[serde(default)]
    pub additions: u64,
    /// Lines deleted
    #[serde(default)]
    pub deletions: u64,
    /// Total lines changed
    #[serde(default)]
    pub total: u64,
}

/// Parent commit reference
#[derive(Clone, Debug, Deserialize)]
pub struct CommitParent {
    /// Parent commit SHA
    pub sha: String,
}

/// A file changed by a commit
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CommitFile {
    /// Blob SHA of the file after the change
    #[serde(default)]
    pub sha: Option<String>,
    /// Path within the repository
    pub filename: String,
    /// Change status (added, modified, removed, renamed, ...)
    #[serde(default)]
    pub status: Option<String>,
    /// Lines added in this file
    #[serde(default)]
    pub additions: u64,
    /// Lines deleted in this file
    #[serde(default)]
    pub deletions: u64,
    /// Total lines changed in this file
    #[serde(default)]
    pub changes: u64,
    /// Raw content URL (absent for e.g. submodule changes)
    #[serde(default)]
    pub raw_url: Option<String>,
    /// Blob browsing URL
    #[serde(default)]
    pub blob_url: Option<String>,
}

/// Repository detail payload
#[derive(Clone, Debug, Deserialize)]
pub struct Repository {
    /// `owner/name`
    pub full_name: String,
    /// Primary language, as reported by the forge
    #[serde(default)]
    pub language: Option<String>,
    /// Star count
    #[serde(default)]
    pub stargazers_count: u64,
    /// Fork count
    #[serde(default)]
    pub forks_count: u64,
    /// Open issue count
    #[serde(default)]
    pub open_issues: u64,
    /// Clone URL
    #[serde(default)]
    pub clone_url: Option<String>,
}

/// Manifest entry for a file belonging to an oversized commit
///
/// Written in lieu of eagerly downloading every file of a mega-merge; a
/// later out-of-band pass fetches the listed `raw_url`s.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ManifestEntry {
    /// Blob SHA
    pub sha: Option<String>,
    /// Path within the repository
    pub filename: String,
    /// Change status
    pub status: Option<String>,
    /// Lines added
    pub additions: u64,
    /// Lines deleted
    pub deletions: u64,
    /// Total lines changed
    pub changes: u64,
    /// Raw content URL
    pub raw_url: Option<String>,
    /// Blob browsing URL
    pub blob_url: Option<String>,
}

impl From<&CommitFile> for ManifestEntry {
    fn from(file: &CommitFile) -> Self {
        Self {
            sha: file.sha.clone(),
            filename: file.filename.clone(),
            status: file.status.clone(),
            additions: file.additions,
            deletions: file.deletions,
            changes: file.changes,
            raw_url: file.raw_url.clone(),
            blob_url: file.blob_url.clone(),
        }
    }
}
