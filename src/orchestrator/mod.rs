//! Pipeline orchestration
//!
//! Stands up the four fetcher instances — search, commit, repo, resource —
//! and wires them into a directed acyclic flow:
//!
//! ```text
//! search ──(dedup, pagination)──▶ commit ──▶ repo ──┬──▶ resource ──▶ sources/
//!                                                   └──▶ manifest (oversized)
//! ```
//!
//! Backpressure is explicit: the search stage admits its next dequeue only
//! while the commit and repo queues are shallow, and the commit/repo stages
//! admit only while the resource queue is shallow. This caps in-flight work
//! at every stage boundary, bounding memory even when the commit stream is
//! effectively unbounded over a multi-day crawl.
//!
//! Completion handlers run on a single consumer task that owns the dedup
//! filters and the store, so no locking is needed around them. Handler
//! failures (malformed payloads, filesystem errors) are logged with the
//! owning repository and commit identity and the task is abandoned; one bad
//! commit must not halt the crawl.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PipelineConfig};
use crate::date_range::{month_shards, parse_date_range};
use crate::dedup::{DedupFilter, DedupLog, commit_signature};
use crate::error::Result;
use crate::fetcher::{ApiPolicy, Completion, Fetcher, ResourcePolicy};
use crate::store::Store;
use crate::types::{
    Commit, Credentials, ManifestEntry, QueueStats, Repository, RequestDescriptor, SearchResults,
};

/// Name of the dedup audit log within the task directory
const DEDUP_LOG_FILE: &str = "dedup-skips.txt";

/// Continuation for search tasks: the query metadata needed to follow
/// pagination links back into the same queue
#[derive(Clone, Debug)]
struct SearchContext {
    shard_query: String,
}

/// Continuation for commit-detail tasks
#[derive(Clone, Debug)]
struct CommitContext {
    sha: String,
    repo_full_name: String,
}

/// Continuation for repo-detail tasks: carries the commit payload forward
#[derive(Debug)]
struct RepoContext {
    commit_raw: Value,
    commit: Commit,
}

/// Continuation for resource tasks
#[derive(Clone, Debug)]
struct ResourceContext {
    repo_full_name: String,
    sha: String,
    filename: String,
}

/// Aggregated queue counters across all four stages
#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineStats {
    /// Search fetcher counters
    pub search: QueueStats,
    /// Commit fetcher counters
    pub commit: QueueStats,
    /// Repo fetcher counters
    pub repo: QueueStats,
    /// Resource fetcher counters
    pub resource: QueueStats,
}

/// The commit harvesting pipeline
pub struct Harvester {
    config: Config,
    task_name: String,
}

impl Harvester {
    /// Validate the configuration and resolve the task name
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let task_name = config.name.clone().unwrap_or_else(|| {
            format!("task-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"))
        });
        Ok(Self { config, task_name })
    }

    /// Output directory name this run writes under
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Run the pipeline until `cancel` fires
    ///
    /// Seeds one search task per calendar-month shard (newest first) and
    /// then drives completions until cancelled. In-flight tasks are
    /// abandoned on cancellation; queue state is not persisted.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let config = &self.config;
        let store = Store::new(&config.output_dir, &self.task_name, config.gzip)?;

        let mut sha_filter = config
            .dedup
            .then(|| DedupFilter::new(&config.dedup_filter));
        let mut signature_filter = config
            .dedup
            .then(|| DedupFilter::new(&config.dedup_filter));
        let mut dedup_log = if config.dedup {
            Some(DedupLog::open(&store.task_dir().join(DEDUP_LOG_FILE)).await?)
        } else {
            None
        };

        let auth = config.token.as_deref().map(Credentials::token);

        // Search and commit/repo endpoints have separate quota pools, so
        // each gets its own independently paced fetcher.
        let search: Fetcher<SearchContext> = Fetcher::new("search");
        let commit: Fetcher<CommitContext> = Fetcher::new("commit");
        let repo: Fetcher<RepoContext> = Fetcher::new("repo");
        let resource: Fetcher<ResourceContext> = Fetcher::new("resource");

        wire_backpressure(&search, &commit, &repo, &resource, &config.pipeline);

        let (search_tx, mut search_rx) = mpsc::channel(128);
        let (commit_tx, mut commit_rx) = mpsc::channel(128);
        let (repo_tx, mut repo_rx) = mpsc::channel(128);
        let (resource_tx, mut resource_rx) = mpsc::channel(128);

        let client = reqwest::Client::builder()
            .user_agent(config.fetch.user_agent.clone())
            .timeout(config.fetch.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.fetch.max_redirects))
            .build()?;

        search.spawn(
            ApiPolicy::with_client(client.clone(), &config.fetch),
            search_tx,
            config.fetch.clone(),
            cancel.child_token(),
        );
        commit.spawn(
            ApiPolicy::with_client(client.clone(), &config.fetch),
            commit_tx,
            config.fetch.clone(),
            cancel.child_token(),
        );
        repo.spawn(
            ApiPolicy::with_client(client, &config.fetch),
            repo_tx,
            config.fetch.clone(),
            cancel.child_token(),
        );
        resource.spawn(
            ResourcePolicy::new(&config.fetch)?,
            resource_tx,
            config.fetch.clone(),
            cancel.child_token(),
        );

        // Seed one search task per month shard, newest first
        let reference = chrono::Utc::now().date_naive();
        let range = parse_date_range(&config.date_range, reference)?;
        for shard in month_shards(range).into_iter().rev() {
            let shard_query = format!("author-date:{shard} {}", config.query);
            let request = RequestDescriptor::get(format!("{}/search/commits", config.api_base))
                .with_query("q", &shard_query)
                .with_query("per_page", "100")
                .with_query("page", "1")
                .with_header("Accept", "application/vnd.github.cloak-preview")
                .with_auth(auth.clone());
            search.enqueue(request, SearchContext { shard_query });
        }

        // Periodic one-line health summary
        let stats_handles = (
            search.clone(),
            commit.clone(),
            repo.clone(),
            resource.clone(),
        );
        let stats_interval = config.pipeline.stats_interval;
        let stats_cancel = cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stats_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stats_cancel.cancelled() => return,
                }
                let stats = PipelineStats {
                    search: stats_handles.0.stats(),
                    commit: stats_handles.1.stats(),
                    repo: stats_handles.2.stats(),
                    resource: stats_handles.3.stats(),
                };
                log_stats(&stats);
            }
        });

        // Single consumer task: handlers own the dedup filters and store
        loop {
            tokio::select! {
                Some(completion) = search_rx.recv() => {
                    self.handle_search(
                        completion,
                        &search,
                        &commit,
                        auth.as_ref(),
                        sha_filter.as_mut(),
                        dedup_log.as_mut(),
                    )
                    .await;
                }
                Some(completion) = commit_rx.recv() => {
                    self.handle_commit(
                        completion,
                        &repo,
                        auth.as_ref(),
                        signature_filter.as_mut(),
                        dedup_log.as_mut(),
                    )
                    .await;
                }
                Some(completion) = repo_rx.recv() => {
                    self.handle_repo(completion, &resource, &store).await;
                }
                Some(completion) = resource_rx.recv() => {
                    self.handle_resource(completion, &store).await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("harvest cancelled, abandoning in-flight tasks");
                    return Ok(());
                }
            }
        }
    }

    /// Search completion: dedup each item, fan into the commit queue,
    /// follow the pagination link back into the search queue
    async fn handle_search(
        &self,
        completion: Completion<SearchContext>,
        search: &Fetcher<SearchContext>,
        commit: &Fetcher<CommitContext>,
        auth: Option<&Credentials>,
        mut sha_filter: Option<&mut DedupFilter>,
        mut dedup_log: Option<&mut DedupLog>,
    ) {
        let results: SearchResults = match serde_json::from_slice(&completion.body) {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(
                    query = %completion.continuation.shard_query,
                    error = %e,
                    "malformed search response, dropping page"
                );
                return;
            }
        };
        tracing::debug!(
            query = %completion.continuation.shard_query,
            items = results.items.len(),
            "search page received"
        );

        for item in results.items {
            if let Some(filter) = sha_filter.as_mut() {
                if filter.check_and_insert(item.sha.as_bytes()) {
                    // Another shard or page already owns this commit
                    tracing::debug!(sha = %item.sha, repo = %item.repository.full_name, "duplicate commit, skipping");
                    record_skip(&mut dedup_log, &item.sha, &item.repository.full_name).await;
                    continue;
                }
            }
            commit.enqueue(
                RequestDescriptor::get(&item.url).with_auth(auth.cloned()),
                CommitContext {
                    sha: item.sha,
                    repo_full_name: item.repository.full_name,
                },
            );
        }

        // Pagination is another producer into the same queue, not a
        // separate loop: re-enqueue the next page with the original query
        // metadata as continuation.
        if let Some(link) = completion
            .headers
            .get("link")
            .and_then(|v| v.to_str().ok())
            .and_then(next_page_link)
        {
            tracing::debug!(url = %link, "queueing next search page");
            let request = RequestDescriptor::get(&link)
                .with_header("Accept", "application/vnd.github.cloak-preview")
                .with_auth(auth.cloned());
            search.enqueue(request, completion.continuation);
        }
    }

    /// Commit completion: collapse near-duplicates by content signature,
    /// then fetch the owning repository with the commit payload as
    /// continuation
    async fn handle_commit(
        &self,
        completion: Completion<CommitContext>,
        repo: &Fetcher<RepoContext>,
        auth: Option<&Credentials>,
        signature_filter: Option<&mut DedupFilter>,
        mut dedup_log: Option<&mut DedupLog>,
    ) {
        let ctx = &completion.continuation;
        let commit_raw: Value = match serde_json::from_slice(&completion.body) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(sha = %ctx.sha, repo = %ctx.repo_full_name, error = %e, "malformed commit payload, dropping");
                return;
            }
        };
        let commit: Commit = match serde_json::from_value(commit_raw.clone()) {
            Ok(commit) => commit,
            Err(e) => {
                tracing::warn!(sha = %ctx.sha, repo = %ctx.repo_full_name, error = %e, "commit payload missing expected fields, dropping");
                return;
            }
        };

        if let Some(filter) = signature_filter {
            let signature = commit_signature(&commit);
            if filter.check_and_insert(signature.as_bytes()) {
                // Same fix reaching the pipeline through an independent
                // path, e.g. mirrored across forks
                tracing::debug!(sha = %commit.sha, repo = %ctx.repo_full_name, "duplicate content signature, skipping");
                record_skip(&mut dedup_log, &commit.sha, &ctx.repo_full_name).await;
                return;
            }
        }

        let repo_url = repository_url(&commit.commit.url);
        repo.enqueue(
            RequestDescriptor::get(repo_url).with_auth(auth.cloned()),
            RepoContext { commit_raw, commit },
        );
    }

    /// Repo completion: persist the combined record, then either fan out
    /// per-file resource tasks or write a manifest for oversized commits
    async fn handle_repo(
        &self,
        completion: Completion<RepoContext>,
        resource: &Fetcher<ResourceContext>,
        store: &Store,
    ) {
        let RepoContext { commit_raw, commit } = completion.continuation;
        let repo_raw: Value = match serde_json::from_slice(&completion.body) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(sha = %commit.sha, error = %e, "malformed repo payload, dropping commit");
                return;
            }
        };
        let repository: Repository = match serde_json::from_value(repo_raw.clone()) {
            Ok(repository) => repository,
            Err(e) => {
                tracing::warn!(sha = %commit.sha, error = %e, "repo payload missing expected fields, dropping commit");
                return;
            }
        };
        let full_name = repository.full_name;

        if let Err(e) = store
            .write_commit(&full_name, &commit.sha, &commit_raw, &repo_raw)
            .await
        {
            tracing::warn!(repo = %full_name, sha = %commit.sha, error = %e, "failed to persist commit record");
            return;
        }

        if commit.files.len() < self.config.pipeline.fanout_threshold {
            let mut queued = 0usize;
            for file in &commit.files {
                if let Some(raw_url) = &file.raw_url {
                    resource.enqueue(
                        RequestDescriptor::get(raw_url),
                        ResourceContext {
                            repo_full_name: full_name.clone(),
                            sha: commit.sha.clone(),
                            filename: file.filename.clone(),
                        },
                    );
                    queued += 1;
                }
            }
            tracing::debug!(repo = %full_name, sha = %commit.sha, files = queued, "commit persisted, files queued");
        } else {
            // Likely a big merge; eagerly downloading every file would
            // flood the resource queue, so record what to fetch instead
            let entries: Vec<ManifestEntry> =
                commit.files.iter().map(ManifestEntry::from).collect();
            match store.write_manifest(&full_name, &commit.sha, &entries).await {
                Ok(_) => {
                    tracing::debug!(repo = %full_name, sha = %commit.sha, files = entries.len(), "commit persisted, manifest written");
                }
                Err(e) => {
                    tracing::warn!(repo = %full_name, sha = %commit.sha, error = %e, "failed to write manifest");
                }
            }
        }
    }

    /// Resource completion: persist raw bytes into the source tree
    async fn handle_resource(&self, completion: Completion<ResourceContext>, store: &Store) {
        let ctx = &completion.continuation;
        if let Err(e) = store
            .write_source(&ctx.repo_full_name, &ctx.sha, &ctx.filename, &completion.body)
            .await
        {
            tracing::warn!(
                repo = %ctx.repo_full_name,
                sha = %ctx.sha,
                file = %ctx.filename,
                error = %e,
                "failed to persist source file"
            );
        }
    }
}

async fn record_skip(dedup_log: &mut Option<&mut DedupLog>, sha: &str, full_name: &str) {
    if let Some(log) = dedup_log {
        if let Err(e) = log.record(sha, full_name).await {
            tracing::warn!(error = %e, "failed to append to dedup log");
        }
    }
}

/// Install the cross-stage admission predicates
///
/// The search stage dequeues only while both the commit and repo queues are
/// below their limits; the commit and repo stages dequeue only while the
/// resource queue is below its limit. A stage sitting exactly at its limit
/// is full.
fn wire_backpressure<S, C, R, D>(
    search: &Fetcher<S>,
    commit: &Fetcher<C>,
    repo: &Fetcher<R>,
    resource: &Fetcher<D>,
    limits: &PipelineConfig,
) where
    S: Send + 'static,
    C: Send + 'static,
    R: Send + 'static,
    D: Send + 'static,
{
    let commit_limit = limits.commit_pending_limit;
    let repo_limit = limits.repo_pending_limit;
    let resource_limit = limits.resource_pending_limit;

    let c = commit.clone();
    let r = repo.clone();
    search.set_admission(move || {
        c.stats().pending < commit_limit && r.stats().pending < repo_limit
    });
    let res = resource.clone();
    commit.set_admission(move || res.stats().pending < resource_limit);
    let res = resource.clone();
    repo.set_admission(move || res.stats().pending < resource_limit);
}

/// Derive the repository API URL from a git commit object URL
///
/// `.../repos/{owner}/{repo}/git/commits/{sha}` → `.../repos/{owner}/{repo}`
fn repository_url(git_commit_url: &str) -> String {
    match git_commit_url.find("/git/commits/") {
        Some(pos) => git_commit_url[..pos].to_string(),
        None => git_commit_url.to_string(),
    }
}

/// Extract the `rel="next"` target from a `Link` response header
fn next_page_link(link_header: &str) -> Option<String> {
    for part in link_header.split(',') {
        let part = part.trim();
        if !part.contains(r#"rel="next""#) {
            continue;
        }
        let start = part.find('<')? + 1;
        let end = part.find('>')?;
        if start < end {
            return Some(part[start..end].to_string());
        }
    }
    None
}

fn log_stats(stats: &PipelineStats) {
    let rss = max_rss_bytes()
        .map(|bytes| format!("{:.1}MiB", bytes as f64 / (1024.0 * 1024.0)))
        .unwrap_or_else(|| "n/a".to_string());
    tracing::info!(
        "stat: sr={}/{}:{}, cm={}/{}:{}, rp={}/{}:{}, rc={}/{}:{}, rss={}",
        stats.search.pending,
        stats.search.finished,
        stats.search.errored,
        stats.commit.pending,
        stats.commit.finished,
        stats.commit.errored,
        stats.repo.pending,
        stats.repo.finished,
        stats.repo.errored,
        stats.resource.pending,
        stats.resource.finished,
        stats.resource.errored,
        rss
    );
}

/// Peak resident set size of this process, when the platform exposes it
#[cfg(unix)]
fn max_rss_bytes() -> Option<u64> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let usage = unsafe { usage.assume_init() };
    // ru_maxrss is kilobytes on Linux, bytes on macOS
    #[cfg(target_os = "macos")]
    {
        Some(usage.ru_maxrss as u64)
    }
    #[cfg(not(target_os = "macos"))]
    {
        Some((usage.ru_maxrss as u64) * 1024)
    }
}

#[cfg(not(unix))]
fn max_rss_bytes() -> Option<u64> {
    None
}
