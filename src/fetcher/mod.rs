//! Generic rate-limited fetch engine
//!
//! A [`Fetcher`] is an ordered queue of [`Task`]s plus an execution loop
//! that serializes requests: at most one request is ever in flight per
//! instance. What a task *is* — JSON API call or bulk download — is decided
//! by the [`FetchPolicy`] the loop is spawned with; the policy also decides
//! how long to pause before the next dequeue.
//!
//! Backpressure is an admission predicate consulted before every dequeue.
//! The predicate typically reads a downstream sibling's
//! [`stats`](Fetcher::stats); while it returns false the loop re-checks on a
//! fixed deferral interval rather than blocking, because the condition
//! depends on another fetcher's progress.
//!
//! Completions are delivered over an mpsc channel as plain values carrying
//! the task's continuation, rather than through dynamically dispatched
//! listeners.

mod api;
mod resource;

pub use api::ApiPolicy;
pub use resource::ResourcePolicy;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::types::{QueueStats, RequestDescriptor, Task};

/// Successful outcome of one request attempt
#[derive(Debug)]
pub struct FetchSuccess {
    /// Response body bytes
    pub body: Vec<u8>,
    /// Response headers (rate-limit and pagination data live here)
    pub headers: HeaderMap,
}

/// Failed outcome of one request attempt
///
/// The distinction matters for backoff: a transport failure suggests the
/// whole network path is down, while an HTTP error response may carry
/// rate-limit headers describing how long to wait.
#[derive(Debug)]
pub enum FetchFailure {
    /// No HTTP response was received (DNS, connection refused, timeout)
    Transport(reqwest::Error),
    /// A non-2xx response was received
    Http {
        /// Response status
        status: StatusCode,
        /// Requested URL
        url: String,
        /// Response headers, for rate-limit-aware backoff
        headers: HeaderMap,
    },
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport failure: {e}"),
            Self::Http { status, url, .. } => write!(f, "HTTP {status} from {url}"),
        }
    }
}

/// Request execution and pacing strategy for one fetcher instance
#[async_trait]
pub trait FetchPolicy: Send + Sync + 'static {
    /// Perform one request attempt
    async fn execute(&self, request: &RequestDescriptor) -> Result<FetchSuccess, FetchFailure>;

    /// Pause before the next dequeue after a success
    fn success_delay(&self, headers: &HeaderMap) -> Duration;

    /// Pause before the next dequeue after a failure
    fn failure_delay(&self, failure: &FetchFailure) -> Duration;
}

/// A completed request, delivered to the owning stage's handler
#[derive(Debug)]
pub struct Completion<C> {
    /// Response body bytes
    pub body: Vec<u8>,
    /// Response headers
    pub headers: HeaderMap,
    /// The continuation attached at enqueue time, unchanged
    pub continuation: C,
}

type AdmissionPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

struct Shared<C> {
    name: String,
    queue: Mutex<VecDeque<Task<C>>>,
    in_flight: AtomicUsize,
    finished: AtomicUsize,
    errored: AtomicUsize,
    admission: RwLock<AdmissionPredicate>,
    wakeup: Notify,
}

/// Handle to one fetcher instance
///
/// Cheap to clone; all clones share the same queue and counters. The
/// execution loop itself is started with [`spawn`](Fetcher::spawn).
pub struct Fetcher<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Fetcher<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Send + 'static> Fetcher<C> {
    /// Create an idle fetcher with an always-admit policy
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                queue: Mutex::new(VecDeque::new()),
                in_flight: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                errored: AtomicUsize::new(0),
                admission: RwLock::new(Arc::new(|| true)),
                wakeup: Notify::new(),
            }),
        }
    }

    /// Append a fresh task to the queue and wake the loop if it is idle
    pub fn enqueue(&self, request: RequestDescriptor, continuation: C) {
        self.enqueue_with_trial(request, continuation, 0);
    }

    fn enqueue_with_trial(&self, request: RequestDescriptor, continuation: C, trial: u32) {
        {
            let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(Task {
                trial,
                request,
                continuation,
            });
        }
        self.shared.wakeup.notify_one();
    }

    /// Install the admission predicate consulted before every dequeue
    ///
    /// Used to implement cross-stage backpressure: the predicate usually
    /// reads a downstream fetcher's pending count.
    pub fn set_admission<F>(&self, predicate: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let mut slot = self
            .shared
            .admission
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Arc::new(predicate);
    }

    /// Snapshot of the queue counters
    ///
    /// `pending` counts queued tasks plus the in-flight request, so sibling
    /// fetchers can use this directly in admission predicates.
    pub fn stats(&self) -> QueueStats {
        let queued = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        QueueStats {
            pending: queued + self.shared.in_flight.load(Ordering::SeqCst),
            finished: self.shared.finished.load(Ordering::SeqCst),
            errored: self.shared.errored.load(Ordering::SeqCst),
        }
    }

    fn admitted(&self) -> bool {
        let predicate = {
            let slot = self
                .shared
                .admission
                .read()
                .unwrap_or_else(|e| e.into_inner());
            Arc::clone(&*slot)
        };
        predicate()
    }

    fn pop(&self) -> Option<Task<C>> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Start the execution loop for this instance
    ///
    /// The loop runs until `cancel` fires or the completion receiver is
    /// dropped. Retry semantics: every failed attempt — transport or HTTP —
    /// re-enqueues the task at the tail with its trial count incremented; a
    /// task that has already used `max_retries` additional attempts is
    /// dropped and logged with its full request context. Moving retries to
    /// the tail keeps a persistently failing task from blocking healthy
    /// tasks behind it.
    pub fn spawn<P: FetchPolicy>(
        &self,
        policy: P,
        completions: mpsc::Sender<Completion<C>>,
        config: FetchConfig,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let fetcher = self.clone();
        tokio::spawn(async move {
            fetcher.run(policy, completions, config, cancel).await;
        })
    }

    async fn run<P: FetchPolicy>(
        self,
        policy: P,
        completions: mpsc::Sender<Completion<C>>,
        config: FetchConfig,
        cancel: CancellationToken,
    ) {
        let name = self.shared.name.clone();
        tracing::debug!(fetcher = %name, "fetcher loop started");

        loop {
            // Wait for work, re-checking admission on the deferral interval
            let task = loop {
                if cancel.is_cancelled() {
                    tracing::debug!(fetcher = %name, "fetcher loop cancelled");
                    return;
                }

                let empty = self
                    .shared
                    .queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_empty();
                if empty {
                    tokio::select! {
                        _ = self.shared.wakeup.notified() => {}
                        _ = cancel.cancelled() => return,
                    }
                    continue;
                }

                if !self.admitted() {
                    tracing::debug!(fetcher = %name, "deferring next request");
                    tokio::select! {
                        _ = tokio::time::sleep(config.deferral_interval) => {}
                        _ = cancel.cancelled() => return,
                    }
                    continue;
                }

                match self.pop() {
                    Some(task) => break task,
                    None => continue,
                }
            };

            tracing::debug!(fetcher = %name, url = %task.request.url, trial = task.trial, "making request");
            self.shared.in_flight.store(1, Ordering::SeqCst);
            let outcome = policy.execute(&task.request).await;
            self.shared.in_flight.store(0, Ordering::SeqCst);

            let delay = match outcome {
                Ok(success) => {
                    self.shared.finished.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(fetcher = %name, url = %task.request.url, "request succeeded");
                    let delay = policy.success_delay(&success.headers);
                    let completion = Completion {
                        body: success.body,
                        headers: success.headers,
                        continuation: task.continuation,
                    };
                    if completions.send(completion).await.is_err() {
                        tracing::debug!(fetcher = %name, "completion channel closed, stopping");
                        return;
                    }
                    delay
                }
                Err(failure) => {
                    self.shared.errored.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        fetcher = %name,
                        url = %task.request.url,
                        trial = task.trial,
                        error = %failure,
                        "request failed"
                    );
                    if task.trial >= config.max_retries {
                        tracing::warn!(
                            fetcher = %name,
                            url = %task.request.url,
                            query = ?task.request.query,
                            trials = task.trial + 1,
                            "retry count exceeded, abandoning task"
                        );
                    } else {
                        self.enqueue_with_trial(
                            task.request,
                            task.continuation,
                            task.trial + 1,
                        );
                    }
                    policy.failure_delay(&failure)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests;
