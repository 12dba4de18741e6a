//! Fetch policy for rate-limited JSON API calls
//!
//! Every response's quota headers feed the pacing algorithm in
//! [`crate::rate_limit`], spreading the remaining permitted calls evenly
//! across the time left in the quota window. Error responses are paced from
//! their own headers when present; transport failures back off aggressively
//! on the assumption the whole network path is unreachable.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::redirect::Policy;
use std::time::Duration;

use super::{FetchFailure, FetchPolicy, FetchSuccess};
use crate::config::FetchConfig;
use crate::error::Result;
use crate::rate_limit::compute_delay;
use crate::types::RequestDescriptor;

/// JSON API policy: identifying user agent, bounded redirects, 10 s timeout,
/// optional token auth, rate-limit-header-driven pacing
pub struct ApiPolicy {
    client: reqwest::Client,
    config: FetchConfig,
}

impl ApiPolicy {
    /// Build a policy with its own HTTP client
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .redirect(Policy::limited(config.max_redirects))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Build a policy over a shared client (connection reuse across the
    /// search/commit/repo fetchers)
    pub fn with_client(client: reqwest::Client, config: &FetchConfig) -> Self {
        Self {
            client,
            config: config.clone(),
        }
    }
}

#[async_trait]
impl FetchPolicy for ApiPolicy {
    async fn execute(
        &self,
        request: &RequestDescriptor,
    ) -> std::result::Result<FetchSuccess, FetchFailure> {
        let mut builder = self.client.get(&request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        let mut has_accept = false;
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("accept") {
                has_accept = true;
            }
            builder = builder.header(name, value);
        }
        if !has_accept {
            builder = builder.header(ACCEPT, "application/json");
        }
        if let Some(auth) = &request.auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = builder.send().await.map_err(FetchFailure::Transport)?;
        let status = response.status();
        let headers = response.headers().clone();
        if !status.is_success() {
            return Err(FetchFailure::Http {
                status,
                url: request.url.clone(),
                headers,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(FetchFailure::Transport)?
            .to_vec();
        Ok(FetchSuccess { body, headers })
    }

    fn success_delay(&self, headers: &HeaderMap) -> Duration {
        compute_delay(Some(headers), &self.config)
    }

    fn failure_delay(&self, failure: &FetchFailure) -> Duration {
        match failure {
            FetchFailure::Transport(_) => compute_delay(None, &self.config),
            FetchFailure::Http { headers, .. } => compute_delay(Some(headers), &self.config),
        }
    }
}
