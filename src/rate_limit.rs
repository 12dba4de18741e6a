//! Rate-limit header interpretation
//!
//! The forge reports its quota state on every API response via three
//! headers: `date` (server clock), `x-ratelimit-remaining` (calls left in
//! the current window) and `x-ratelimit-reset` (UNIX time the window
//! resets). [`compute_delay`] spreads the remaining permitted calls evenly
//! across the time left in the window, so the scheduled wait shrinks toward
//! zero as quota frees up and grows toward the full window as it runs out.

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use std::time::Duration;

use crate::config::FetchConfig;

/// Quota state parsed from one response's headers
///
/// Not stored anywhere; consumed immediately to compute a scheduling delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    /// Server clock at response time
    pub server_time: DateTime<Utc>,
    /// Calls remaining in the current quota window
    pub remaining: u64,
    /// When the quota window resets
    pub reset_at: DateTime<Utc>,
}

impl RateLimitSnapshot {
    /// Parse the three quota headers; `None` if any is missing or malformed
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let server_time = headers
            .get("date")?
            .to_str()
            .ok()
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())?
            .with_timezone(&Utc);

        let remaining: u64 = headers
            .get("x-ratelimit-remaining")?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()?;

        let reset_secs: i64 = headers
            .get("x-ratelimit-reset")?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let reset_at = Utc.timestamp_opt(reset_secs, 0).single()?;

        Some(Self {
            server_time,
            remaining,
            reset_at,
        })
    }

    /// Spread the remaining quota evenly over the time left in the window
    ///
    /// `remaining == 0` yields the full remaining window. A reset time in
    /// the past yields zero.
    pub fn delay(&self) -> Duration {
        let window_ms = (self.reset_at - self.server_time).num_milliseconds();
        if window_ms <= 0 {
            return Duration::ZERO;
        }
        let divisor = self.remaining.max(1);
        let delay_ms = (window_ms as f64 / divisor as f64).round() as u64;
        Duration::from_millis(delay_ms)
    }
}

/// Compute the next-dequeue delay for an API fetcher
///
/// - `None` means no response arrived at all (transport failure); back off
///   aggressively on the theory the whole network path is down.
/// - Headers without a complete, well-formed quota triple degrade to the
///   conservative default delay.
pub fn compute_delay(headers: Option<&HeaderMap>, config: &FetchConfig) -> Duration {
    match headers {
        None => config.api_aggressive_delay,
        Some(headers) => match RateLimitSnapshot::from_headers(headers) {
            Some(snapshot) => {
                tracing::debug!(
                    remaining = snapshot.remaining,
                    reset_at = %snapshot.reset_at,
                    delay_ms = snapshot.delay().as_millis() as u64,
                    "rate limit headers"
                );
                snapshot.delay()
            }
            None => config.api_default_delay,
        },
    }
}
