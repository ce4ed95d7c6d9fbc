/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use pipecall_core::config::{default_config_path, NegotiatorConfig};
use pipecall_core::{EventKind, Negotiator, NoMedia, WebrtcEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

struct Args {
    config: Option<PathBuf>,
    keyword: String,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut keyword = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config requires a path")?;
            config = Some(PathBuf::from(path));
        } else if keyword.is_none() {
            keyword = Some(arg);
        } else {
            anyhow::bail!("unexpected argument: {arg}");
        }
    }
    if config.is_none() {
        config = std::env::var("PIPECALL_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
    }
    let keyword = keyword
        .or_else(|| std::env::var("PIPECALL_KEYWORD").ok())
        .filter(|k| !k.trim().is_empty())
        .context("usage: pipecall [--config path] <keyword>")?;
    Ok(Args { config, keyword })
}

fn load_config(explicit: Option<PathBuf>) -> Result<NegotiatorConfig> {
    let mut cfg = match explicit {
        Some(path) => NegotiatorConfig::from_json_file(&path)?,
        None => {
            let path = default_config_path()?;
            if path.exists() {
                NegotiatorConfig::from_json_file(&path)?
            } else {
                debug!("no config at {}, using defaults", path.display());
                NegotiatorConfig::default()
            }
        }
    };
    cfg.apply_env();
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let args = parse_args()?;
    let settings = load_config(args.config)?.resolve();
    info!(relay = %settings.relay_url, version = pipecall_core::version(), "pipecall starting");

    let engine = Arc::new(WebrtcEngine::new(&settings));
    let negotiator = Negotiator::new(settings, engine, Arc::new(NoMedia));

    let mut events = negotiator.subscribe();
    tokio::spawn(async move {
        loop {
            let ev = match events.recv().await {
                Ok(ev) => ev,
                Err(RecvError::Lagged(n)) => {
                    warn!("dropped {n} events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match &ev.kind {
                EventKind::TimeRemaining { secs } if secs % 30 != 0 => {}
                EventKind::Error { phase, message } => error!(%phase, "{message}"),
                EventKind::Status { role, phase, message } => {
                    info!(%role, %phase, "{message}")
                }
                other => info!(event = ?other),
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("shutdown requested");
            negotiator.disconnect().await;
            return Ok(());
        }
        res = negotiator.connect(&args.keyword) => {
            if let Err(e) = res {
                negotiator.disconnect().await;
                return Err(e).context("connect failed");
            }
        }
    }

    info!(role = %negotiator.role(), "connected, press ctrl-c to hang up");
    if let Err(e) = ctrl_c.await {
        warn!("ctrl-c handler failed: {e}");
    }
    info!("shutdown requested");
    negotiator.disconnect().await;
    Ok(())
}
