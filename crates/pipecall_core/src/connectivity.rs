/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Thin façade over the real-time transport engine.
//!
//! The engine itself (ICE, DTLS, media) is a black box behind [`ConnectivityEngine`];
//! its callbacks arrive as [`EngineEvent`]s on a channel.

use anyhow::Result;
use async_trait::async_trait;
use pipecall_protocol::{IceCandidate, SessionDescription};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_lost(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed | LinkState::Closed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Candidate(IceCandidate),
    GatheringComplete,
    LinkState(LinkState),
}

/// Opaque local media handed to the engine. Engines downcast what they understand.
#[derive(Clone, Default)]
pub struct MediaHandle {
    pub label: String,
    inner: Option<Arc<dyn Any + Send + Sync>>,
}

impl MediaHandle {
    pub fn new(label: impl Into<String>, inner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            label: label.into(),
            inner: Some(inner),
        }
    }

    pub fn none() -> Self {
        Self {
            label: "none".to_string(),
            inner: None,
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("label", &self.label)
            .field("has_media", &self.inner.is_some())
            .finish()
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<MediaHandle>;
}

/// Data-only calls.
pub struct NoMedia;

#[async_trait]
impl MediaSource for NoMedia {
    async fn acquire(&self) -> Result<MediaHandle> {
        Ok(MediaHandle::none())
    }
}

#[async_trait]
pub trait ConnectivityEngine: Send + Sync {
    async fn create_session(
        &self,
        media: &MediaHandle,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn ConnectivitySession>>;
}

#[async_trait]
pub trait ConnectivitySession: Send + Sync {
    /// Creates the offer and applies it locally; gathering starts here.
    async fn create_offer(&self) -> Result<SessionDescription>;
    /// Creates the answer and applies it locally; needs the remote offer first.
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self);
}

/// Link-state change tagged with the driver generation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkUpdate {
    pub generation: u64,
    pub state: LinkState,
}

/// Owns one engine session and the candidates it gathered.
pub struct ConnectivityDriver {
    generation: u64,
    session: Arc<dyn ConnectivitySession>,
    candidates: Vec<IceCandidate>,
    gathering_done: bool,
    pump: tokio::task::JoinHandle<()>,
    gathered_rx: mpsc::UnboundedReceiver<Option<IceCandidate>>,
}

impl ConnectivityDriver {
    /// Opens a fresh engine session. Link-state changes are forwarded to `links`.
    pub async fn open(
        engine: &dyn ConnectivityEngine,
        media: &MediaHandle,
        generation: u64,
        links: mpsc::UnboundedSender<LinkUpdate>,
    ) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
        let session = engine.create_session(media, tx).await?;

        // Split engine events: candidates stay with the driver, link changes go upstream.
        let (gathered_tx, gathered_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                match ev {
                    EngineEvent::Candidate(c) => {
                        let _ = gathered_tx.send(Some(c));
                    }
                    EngineEvent::GatheringComplete => {
                        let _ = gathered_tx.send(None);
                    }
                    EngineEvent::LinkState(state) => {
                        debug!(generation, %state, "link state");
                        if links.send(LinkUpdate { generation, state }).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            generation,
            session,
            candidates: Vec::new(),
            gathering_done: false,
            pump,
            gathered_rx,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.session.create_offer().await
    }

    /// Applies the remote offer and returns our answer.
    pub async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.session.set_remote_description(offer).await?;
        self.session.create_answer().await
    }

    pub async fn apply_answer(&self, answer: SessionDescription) -> Result<()> {
        self.session.set_remote_description(answer).await
    }

    fn drain_ready(&mut self) {
        while let Ok(item) = self.gathered_rx.try_recv() {
            match item {
                Some(c) => self.candidates.push(c),
                None => self.gathering_done = true,
            }
        }
    }

    /// Waits until gathering completes or `wait` elapses, then returns the whole batch.
    pub async fn gather_candidates(&mut self, wait: Duration) -> Vec<IceCandidate> {
        self.drain_ready();
        if !self.gathering_done {
            let deadline = tokio::time::Instant::now() + wait;
            loop {
                match tokio::time::timeout_at(deadline, self.gathered_rx.recv()).await {
                    Ok(Some(Some(c))) => self.candidates.push(c),
                    Ok(Some(None)) => {
                        self.gathering_done = true;
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        debug!(
                            generation = self.generation,
                            count = self.candidates.len(),
                            "candidate gathering still running, sending what we have"
                        );
                        break;
                    }
                }
            }
        }
        self.candidates.clone()
    }

    /// Applies remote candidates in the order received. Returns how many the engine took.
    pub async fn add_candidates(&self, candidates: Vec<IceCandidate>) -> usize {
        let mut applied = 0;
        for c in candidates {
            match self.session.add_candidate(c).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(generation = self.generation, "remote candidate rejected: {e:#}"),
            }
        }
        applied
    }

    pub async fn close(self) {
        self.pump.abort();
        self.session.close().await;
    }
}

impl Drop for ConnectivityDriver {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
