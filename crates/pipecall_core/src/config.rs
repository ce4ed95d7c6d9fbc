/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RELAY_URL: &str = "https://ppng.io";
pub const DEFAULT_ICE_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// On-disk / caller-supplied configuration. Every field is optional; see [`Settings`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// Base URL of the blocking relay, e.g. `https://ppng.io`.
    pub relay_url: Option<String>,
    /// Window the host's offer PUT stays parked waiting for a guest.
    pub offer_timeout_secs: Option<u64>,
    /// Window for answer and candidate calls.
    pub short_timeout_secs: Option<u64>,
    pub gather_timeout_secs: Option<u64>,
    pub lifetime_secs: Option<u64>,
    pub tick_secs: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay_ms: Option<u64>,
    pub auto_reconnect: Option<bool>,
    /// Local attempts per relay call (network errors, 429, 5xx).
    pub retry_attempts: Option<u32>,
    /// ICE server URLs (e.g. `stun:stun.l.google.com:19302`, `turn:turn.example:3478?transport=udp`).
    pub ice_urls: Option<Vec<String>>,
    pub ice_username: Option<String>,
    pub ice_credential: Option<String>,
}

/// Resolved configuration with defaults applied and ranges clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub relay_url: String,
    pub offer_timeout_secs: u64,
    pub short_timeout_secs: u64,
    pub gather_timeout: Duration,
    pub lifetime: Duration,
    pub tick: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub auto_reconnect: bool,
    pub retry_attempts: u32,
    pub ice_urls: Vec<String>,
    pub ice_username: Option<String>,
    pub ice_credential: Option<String>,
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl NegotiatorConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("decode NegotiatorConfig")
    }

    /// Applies `PIPECALL_RELAY_URL`, `PIPECALL_LIFETIME_SECS` and `PIPECALL_ICE_URLS`.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|k| std::env::var(k).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("PIPECALL_RELAY_URL").filter(|v| !v.trim().is_empty()) {
            self.relay_url = Some(v);
        }
        if let Some(v) = get("PIPECALL_LIFETIME_SECS").and_then(|v| v.trim().parse().ok()) {
            self.lifetime_secs = Some(v);
        }
        if let Some(v) = get("PIPECALL_ICE_URLS") {
            let urls: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !urls.is_empty() {
                self.ice_urls = Some(urls);
            }
        }
    }

    pub fn resolve(&self) -> Settings {
        let relay_url = non_empty(&self.relay_url)
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let ice_urls = self
            .ice_urls
            .clone()
            .unwrap_or_else(|| DEFAULT_ICE_URLS.iter().map(|s| s.to_string()).collect());
        Settings {
            relay_url,
            offer_timeout_secs: self.offer_timeout_secs.unwrap_or(60).max(5).min(600),
            short_timeout_secs: self.short_timeout_secs.unwrap_or(5).max(1).min(60),
            gather_timeout: Duration::from_secs(self.gather_timeout_secs.unwrap_or(5).max(1).min(60)),
            lifetime: Duration::from_secs(self.lifetime_secs.unwrap_or(600).max(1).min(86_400)),
            tick: Duration::from_secs(self.tick_secs.unwrap_or(1).max(1).min(60)),
            max_reconnect_attempts: self.max_reconnect_attempts.unwrap_or(3).min(20),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms.unwrap_or(2000).min(60_000)),
            auto_reconnect: self.auto_reconnect.unwrap_or(true),
            retry_attempts: self.retry_attempts.unwrap_or(3).max(1).min(5),
            ice_urls,
            ice_username: non_empty(&self.ice_username),
            ice_credential: non_empty(&self.ice_credential),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        NegotiatorConfig::default().resolve()
    }
}

/// Platform config location, overridable with `PIPECALL_CONFIG_DIR`.
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("PIPECALL_CONFIG_DIR") {
        return Ok(PathBuf::from(v).join("config.json"));
    }
    let proj = ProjectDirs::from("net", "pipecall", "Pipecall")
        .context("unable to determine platform config dir")?;
    Ok(proj.config_dir().join("config.json"))
}
