/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Serverless two-party call setup over a dumb blocking HTTP relay.

pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod http_retry;
pub mod lifetime;
pub mod negotiator;
pub mod net_metrics;
pub mod obfuscate;
pub mod relay_client;
pub mod session;
pub mod webrtc_engine;

pub use config::{NegotiatorConfig, Settings};
pub use connectivity::{
    ConnectivityEngine, ConnectivitySession, EngineEvent, LinkState, MediaHandle, MediaSource,
    NoMedia,
};
pub use error::NegotiationError;
pub use events::{EventKind, NegotiationEvent};
pub use negotiator::Negotiator;
pub use session::{Phase, Role};
pub use webrtc_engine::WebrtcEngine;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
