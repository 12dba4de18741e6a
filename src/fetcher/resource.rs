//! Fetch policy for bulk content downloads
//!
//! Content-delivery endpoints do not carry quota headers, so pacing is
//! fixed: effectively immediate after a success, a flat backoff after any
//! failure. The body is raw bytes, never parsed.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use std::time::Duration;

use super::{FetchFailure, FetchPolicy, FetchSuccess};
use crate::config::FetchConfig;
use crate::error::Result;
use crate::types::RequestDescriptor;

/// Bulk download policy: fixed small inter-request delay, flat failure backoff
pub struct ResourcePolicy {
    client: reqwest::Client,
    config: FetchConfig,
}

impl ResourcePolicy {
    /// Build a policy with its own HTTP client
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .redirect(Policy::limited(config.max_redirects))
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl FetchPolicy for ResourcePolicy {
    async fn execute(
        &self,
        request: &RequestDescriptor,
    ) -> std::result::Result<FetchSuccess, FetchFailure> {
        let mut builder = self.client.get(&request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
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

    fn success_delay(&self, _headers: &HeaderMap) -> Duration {
        self.config.resource_success_delay
    }

    fn failure_delay(&self, _failure: &FetchFailure) -> Duration {
        self.config.resource_failure_delay
    }
}
