//! Configuration types for forge-harvest

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Fetch engine behavior (retry bound, pacing delays, HTTP client settings)
///
/// Groups settings consumed by the fetchers. Used as a nested sub-config
/// within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum additional attempts for a failed request (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait between admission re-checks while a stage is throttled (default: 3s)
    #[serde(default = "default_deferral_interval")]
    pub deferral_interval: Duration,

    /// API delay when rate-limit headers are missing or malformed (default: 10s)
    #[serde(default = "default_api_default_delay")]
    pub api_default_delay: Duration,

    /// API delay after a transport failure, when no response arrived (default: 60s)
    #[serde(default = "default_api_aggressive_delay")]
    pub api_aggressive_delay: Duration,

    /// Delay between successful resource downloads (default: 1ms)
    #[serde(default = "default_resource_success_delay")]
    pub resource_success_delay: Duration,

    /// Delay after a failed resource download (default: 10s)
    #[serde(default = "default_resource_failure_delay")]
    pub resource_failure_delay: Duration,

    /// Per-request timeout (default: 10s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Maximum redirects to follow (default: 3)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Identifying User-Agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            deferral_interval: default_deferral_interval(),
            api_default_delay: default_api_default_delay(),
            api_aggressive_delay: default_api_aggressive_delay(),
            resource_success_delay: default_resource_success_delay(),
            resource_failure_delay: default_resource_failure_delay(),
            request_timeout: default_request_timeout(),
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
        }
    }
}

/// Pipeline wiring: backpressure limits and the fan-out threshold
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Commits touching at least this many files get a manifest instead of
    /// eager per-file downloads (default: 10)
    ///
    /// Commits above the threshold are likely big merges whose file contents
    /// are noisy; flooding the resource queue with them starves everything
    /// else.
    #[serde(default = "default_fanout_threshold")]
    pub fanout_threshold: usize,

    /// Search stage admits only while the commit fetcher has fewer pending
    /// tasks than this (default: 50)
    #[serde(default = "default_commit_pending_limit")]
    pub commit_pending_limit: usize,

    /// Search stage admits only while the repo fetcher has fewer pending
    /// tasks than this (default: 50)
    #[serde(default = "default_repo_pending_limit")]
    pub repo_pending_limit: usize,

    /// Commit and repo stages admit only while the resource fetcher has
    /// fewer pending tasks than this (default: 100)
    #[serde(default = "default_resource_pending_limit")]
    pub resource_pending_limit: usize,

    /// Interval between periodic statistics log lines (default: 30s)
    #[serde(default = "default_stats_interval")]
    pub stats_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fanout_threshold: default_fanout_threshold(),
            commit_pending_limit: default_commit_pending_limit(),
            repo_pending_limit: default_repo_pending_limit(),
            resource_pending_limit: default_resource_pending_limit(),
            stats_interval: default_stats_interval(),
        }
    }
}

/// Sizing for the probabilistic dedup filters
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Expected number of insertions (default: 10,000,000)
    #[serde(default = "default_expected_items")]
    pub expected_items: usize,

    /// Target false-positive rate (default: 1e-5)
    #[serde(default = "default_false_positive_rate")]
    pub false_positive_rate: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            expected_items: default_expected_items(),
            false_positive_rate: default_false_positive_rate(),
        }
    }
}

/// Main configuration for the harvester
///
/// Fields are organized into logical sub-configs:
/// - [`fetch`](FetchConfig) — retry bound, pacing, HTTP client settings
/// - [`pipeline`](PipelineConfig) — backpressure limits, fan-out threshold
/// - [`dedup_filter`](DedupConfig) — bloom filter sizing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Search query term (e.g. `"buffer overflow"`)
    pub query: String,

    /// Date range to shard into calendar months
    ///
    /// Accepts `YYYY-MM..YYYY-MM` or a relative `- <N>y <M>m` form
    /// (e.g. `- 2y 3m` for "since two years and three months ago").
    pub date_range: String,

    /// Root output directory (default: "./harvests")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Task name; a random name is generated when absent. Output lands under
    /// `{output_dir}/{name}/`.
    #[serde(default)]
    pub name: Option<String>,

    /// Forge API token. Without one the forge's anonymous quota is very low.
    #[serde(default)]
    pub token: Option<String>,

    /// Gzip-compress persisted commit records (default: false)
    #[serde(default)]
    pub gzip: bool,

    /// Enable the bloom-filter dedup stage (default: true)
    #[serde(default = "default_true")]
    pub dedup: bool,

    /// Search API base URL, overridable for testing (default: forge API root)
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Fetch engine settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Pipeline wiring settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Dedup filter sizing
    #[serde(default)]
    pub dedup_filter: DedupConfig,
}

impl Config {
    /// Validate settings that would otherwise fail deep inside the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::Config {
                message: "query must not be empty".to_string(),
                key: Some("query".to_string()),
            });
        }
        if self.pipeline.fanout_threshold == 0 {
            return Err(Error::Config {
                message: "fanout_threshold must be at least 1".to_string(),
                key: Some("pipeline.fanout_threshold".to_string()),
            });
        }
        if self.pipeline.commit_pending_limit == 0
            || self.pipeline.repo_pending_limit == 0
            || self.pipeline.resource_pending_limit == 0
        {
            return Err(Error::Config {
                message: "pending limits must be at least 1".to_string(),
                key: Some("pipeline".to_string()),
            });
        }
        let fp = self.dedup_filter.false_positive_rate;
        if !(fp > 0.0 && fp < 1.0) {
            return Err(Error::Config {
                message: format!("false_positive_rate must be in (0, 1), got {fp}"),
                key: Some("dedup_filter.false_positive_rate".to_string()),
            });
        }
        if self.dedup_filter.expected_items == 0 {
            return Err(Error::Config {
                message: "expected_items must be at least 1".to_string(),
                key: Some("dedup_filter.expected_items".to_string()),
            });
        }
        Ok(())
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_deferral_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_api_default_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_api_aggressive_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_resource_success_delay() -> Duration {
    Duration::from_millis(1)
}

fn default_resource_failure_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_redirects() -> usize {
    3
}

fn default_user_agent() -> String {
    format!("forge-harvest/{}", env!("CARGO_PKG_VERSION"))
}

fn default_fanout_threshold() -> usize {
    10
}

fn default_commit_pending_limit() -> usize {
    50
}

fn default_repo_pending_limit() -> usize {
    50
}

fn default_resource_pending_limit() -> usize {
    100
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_expected_items() -> usize {
    10_000_000
}

fn default_false_positive_rate() -> f64 {
    1e-5
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./harvests")
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        serde_json::from_str(r#"{"query": "overflow", "date_range": "2019-01..2019-03"}"#)
            .expect("minimal config should deserialize")
    }

    #[test]
    fn defaults_match_hand_tuned_constants() {
        let config = minimal();
        assert_eq!(config.fetch.max_retries, 3);
        assert_eq!(config.fetch.deferral_interval, Duration::from_secs(3));
        assert_eq!(config.fetch.api_default_delay, Duration::from_secs(10));
        assert_eq!(config.fetch.api_aggressive_delay, Duration::from_secs(60));
        assert_eq!(config.pipeline.fanout_threshold, 10);
        assert_eq!(config.pipeline.commit_pending_limit, 50);
        assert_eq!(config.pipeline.resource_pending_limit, 100);
        assert_eq!(config.dedup_filter.expected_items, 10_000_000);
        assert!(config.dedup);
        assert!(!config.gzip);
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_query() {
        let mut config = minimal();
        config.query = "   ".to_string();
        assert!(matches!(
            config.validate(),
            Err(Error::Config { key: Some(k), .. }) if k == "query"
        ));
    }

    #[test]
    fn validate_rejects_zero_fanout_threshold() {
        let mut config = minimal();
        config.pipeline.fanout_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_false_positive_rate() {
        let mut config = minimal();
        config.dedup_filter.false_positive_rate = 1.5;
        assert!(config.validate().is_err());

        config.dedup_filter.false_positive_rate = 0.0;
        assert!(config.validate().is_err());
    }
}
