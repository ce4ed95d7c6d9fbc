/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rand::{thread_rng, Rng};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::net_metrics::NetMetrics;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.clamp(1, 5),
            ..Self::default()
        }
    }

    /// Single shot, used where a retry would outlive the caller's interest (cancel).
    pub fn once() -> Self {
        Self::new(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Sends the request built by `build`, retrying network failures, 429 and 5xx.
///
/// The last response is returned as-is even when its status is retryable, so callers
/// still see the relay's status code.
pub async fn send_with_retry<F>(
    mut build: F,
    policy: RetryPolicy,
    metrics: &NetMetrics,
) -> Result<Response, reqwest::Error>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = policy.attempts.clamp(1, 5);
    let mut backoff = policy.base_backoff;
    let mut attempt = 0;
    loop {
        attempt += 1;
        metrics.relay_request();
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                if should_retry_status(status) {
                    metrics.http_error();
                    if attempt < max_attempts {
                        debug!(%status, attempt, "relay busy, retrying");
                        sleep_with_jitter(backoff).await;
                        backoff = backoff.saturating_mul(2).min(policy.max_backoff);
                        continue;
                    }
                }
                return Ok(resp);
            }
            Err(e) => {
                if e.is_timeout() {
                    metrics.http_timeout();
                } else {
                    metrics.http_error();
                }
                if attempt >= max_attempts {
                    return Err(e);
                }
                debug!(attempt, "relay request failed, retrying: {e}");
                sleep_with_jitter(backoff).await;
                backoff = backoff.saturating_mul(2).min(policy.max_backoff);
            }
        }
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}
