/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Client for a dumb blocking relay (piping-server style).
//!
//! A PUT parks on the relay until someone GETs the same path (or the relay gives up and
//! answers `[TIMEOUT]`), so `send` doubles as "wait until the peer took it".

use pipecall_protocol::{HEADER_CANCEL_KEY, HEADER_TIMEOUT, MARKER_OK, MARKER_TIMEOUT};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::http_retry::{send_with_retry, RetryPolicy};
use crate::net_metrics::NetMetrics;
use crate::obfuscate;

/// Added on top of the relay-side window so the relay always answers first.
const CLIENT_GRACE: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("relay unreachable: {0}")]
    Network(#[from] reqwest::Error),
    #[error("payload encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("request aborted locally")]
    Cancelled,
}

impl RelayError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RelayError::Http { status, .. } => Some(*status),
            RelayError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOutcome {
    pub success: bool,
    pub timed_out: bool,
}

pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
    metrics: Arc<NetMetrics>,
    cancel_key: RwLock<Option<String>>,
    inflight: Mutex<CancellationToken>,
}

impl RelayClient {
    pub fn new(base_url: &str, policy: RetryPolicy, metrics: Arc<NetMetrics>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, policy, metrics)
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: &str,
        policy: RetryPolicy,
        metrics: Arc<NetMetrics>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            policy,
            metrics,
            cancel_key: RwLock::new(None),
            inflight: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<NetMetrics> {
        &self.metrics
    }

    /// Credential attached to every following PUT and GET as `X-Cancel-Key`.
    pub fn set_cancel_key(&self, key: Option<String>) {
        *self.cancel_key.write().unwrap_or_else(|e| e.into_inner()) = key;
    }

    pub fn cancel_key(&self) -> Option<String> {
        self.cancel_key
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn inflight_token(&self) -> CancellationToken {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn guarded<T, F>(&self, fut: F) -> Result<T, RelayError>
    where
        F: Future<Output = Result<T, RelayError>>,
    {
        let token = self.inflight_token();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(RelayError::Cancelled),
            r = fut => r,
        }
    }

    /// HEAD probe. Only a 200 counts as "exists"; every failure reads as absent.
    pub async fn exists(&self, path: &str) -> bool {
        let url = self.url(path);
        let fut = async {
            let resp = send_with_retry(
                || self.http.head(&url).timeout(PROBE_TIMEOUT),
                self.policy,
                &self.metrics,
            )
            .await?;
            Ok::<_, RelayError>(resp.status())
        };
        match self.guarded(fut).await {
            Ok(status) => {
                debug!(%path, %status, "relay probe");
                status == StatusCode::OK
            }
            Err(e) => {
                debug!(%path, "relay probe failed: {e}");
                false
            }
        }
    }

    /// Publishes `payload` on `path` and waits for a consumer (or the relay's timeout).
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        key: &str,
        timeout_secs: u64,
    ) -> Result<SendOutcome, RelayError> {
        let json = serde_json::to_vec(payload)?;
        let body = obfuscate::encode(&json, key);
        let url = self.url(path);
        let cancel_key = self.cancel_key();
        let deadline = Duration::from_secs(timeout_secs) + CLIENT_GRACE;
        self.metrics.relay_tx_add(body.len() as u64);

        let fut = async {
            let resp = send_with_retry(
                || {
                    let mut req = self
                        .http
                        .put(&url)
                        .header(CONTENT_TYPE, "text/plain")
                        .header(HEADER_TIMEOUT, timeout_secs.to_string())
                        .timeout(deadline)
                        .body(body.clone());
                    if let Some(k) = &cancel_key {
                        req = req.header(HEADER_CANCEL_KEY, k.as_str());
                    }
                    req
                },
                self.policy,
                &self.metrics,
            )
            .await?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            self.metrics.relay_rx_add(text.len() as u64);
            if !status.is_success() {
                return Err(RelayError::Http {
                    status: status.as_u16(),
                    body: text.chars().take(200).collect(),
                });
            }
            let success = text.contains(MARKER_OK);
            let timed_out = !success && text.contains(MARKER_TIMEOUT);
            if timed_out {
                self.metrics.relay_timeout();
            }
            Ok::<_, RelayError>(SendOutcome { success, timed_out })
        };
        let outcome = self.guarded(fut).await;
        debug!(%path, ?outcome, "relay put");
        outcome
    }

    /// Consumes whatever is parked on `path`. `None` covers every kind of miss: HTTP error,
    /// empty body, relay timeout, undecodable payload, local abort.
    pub async fn receive<T: DeserializeOwned>(
        &self,
        path: &str,
        key: &str,
        timeout_secs: u64,
    ) -> Option<T> {
        let url = self.url(path);
        let cancel_key = self.cancel_key();
        let deadline = Duration::from_secs(timeout_secs) + CLIENT_GRACE;

        let fut = async {
            let resp = send_with_retry(
                || {
                    let mut req = self
                        .http
                        .get(&url)
                        .header(HEADER_TIMEOUT, timeout_secs.to_string())
                        .timeout(deadline);
                    if let Some(k) = &cancel_key {
                        req = req.header(HEADER_CANCEL_KEY, k.as_str());
                    }
                    req
                },
                self.policy,
                &self.metrics,
            )
            .await?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            Ok::<_, RelayError>((status, text))
        };

        let (status, text) = match self.guarded(fut).await {
            Ok(v) => v,
            Err(e) => {
                debug!(%path, "relay get failed: {e}");
                return None;
            }
        };
        self.metrics.relay_rx_add(text.len() as u64);
        if !status.is_success() {
            debug!(%path, %status, "relay get rejected");
            return None;
        }
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if text.contains(MARKER_TIMEOUT) {
            self.metrics.relay_timeout();
            return None;
        }
        let plain = match obfuscate::decode(text, key) {
            Ok(v) => v,
            Err(e) => {
                warn!(%path, "relay payload not decodable: {e}");
                return None;
            }
        };
        match serde_json::from_slice(&plain) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(%path, "relay payload bad json: {e}");
                None
            }
        }
    }

    /// Asks the relay to drop our own pending PUT/GET on `path`. Best effort.
    pub async fn cancel(&self, path: &str) {
        if let Some(key) = self.cancel_key() {
            self.cancel_with_key(path, &key).await;
        }
    }

    /// Same as [`cancel`](Self::cancel) with an explicit credential, for sessions that
    /// have already been replaced.
    pub async fn cancel_with_key(&self, path: &str, key: &str) {
        let url = self.url(path);
        let res = send_with_retry(
            || {
                self.http
                    .delete(&url)
                    .header(HEADER_CANCEL_KEY, key)
                    .timeout(CANCEL_TIMEOUT)
            },
            RetryPolicy::once(),
            &self.metrics,
        )
        .await;
        match res {
            Ok(resp) => debug!(%path, status = %resp.status(), "relay cancel"),
            Err(e) => debug!(%path, "relay cancel failed: {e}"),
        }
    }

    /// Aborts every request currently in flight on this client. The relay is not told.
    pub fn abort_local(&self) {
        let mut guard = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        guard.cancel();
        *guard = CancellationToken::new();
    }
}
