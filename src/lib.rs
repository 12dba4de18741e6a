//! # forge-harvest
//!
//! Rate-limited ingestion pipeline that harvests version-control commits
//! from a code-forge search API and persists them for downstream
//! vulnerability-mining analysis.
//!
//! ## Design Philosophy
//!
//! - **Quota-respecting** - every API response's rate-limit headers drive
//!   the pacing of the next request
//! - **Backpressured** - a fast upstream stage can never unboundedly queue
//!   work for a slow downstream stage
//! - **Crash-tolerant per task** - one bad commit is logged and dropped,
//!   never halting a multi-day crawl
//! - **Library-first** - no CLI or UI, purely a Rust crate for embedding
//!
//! ## Quick Start
//!
//! ```no_run
//! use forge_harvest::{Config, Harvester, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config: Config = serde_json::from_str(
//!         r#"{"query": "buffer overflow", "date_range": "- 2y"}"#,
//!     )?;
//!     config.token = std::env::var("FORGE_TOKEN").ok();
//!
//!     let harvester = Harvester::new(config)?;
//!     run_with_shutdown(harvester).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Date-range parsing and calendar-month sharding
pub mod date_range;
/// Probabilistic commit deduplication
pub mod dedup;
/// Error types
pub mod error;
/// Generic rate-limited fetch engine and concrete policies
pub mod fetcher;
/// Pipeline orchestration
pub mod orchestrator;
/// Rate-limit header interpretation
pub mod rate_limit;
/// Shared repository clone cache
pub mod repo_cache;
/// On-disk output layout
pub mod store;
/// Core types shared across the pipeline
pub mod types;

// Re-export commonly used types
pub use config::{Config, DedupConfig, FetchConfig, PipelineConfig};
pub use dedup::{DedupFilter, DedupLog, commit_signature};
pub use error::{Error, Result};
pub use fetcher::{
    ApiPolicy, Completion, FetchFailure, FetchPolicy, FetchSuccess, Fetcher, ResourcePolicy,
};
pub use orchestrator::{Harvester, PipelineStats};
pub use rate_limit::{RateLimitSnapshot, compute_delay};
pub use repo_cache::RepoCache;
pub use store::Store;
pub use types::{Credentials, QueueStats, RequestDescriptor, Task};

use tokio_util::sync::CancellationToken;

/// Run the harvester until a termination signal arrives.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// In-flight tasks are abandoned on shutdown; queue state is not persisted.
pub async fn run_with_shutdown(harvester: Harvester) -> Result<()> {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_cancel.cancel();
    });
    harvester.run(cancel).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
