/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Host/guest handshake over the relay, lifetime timer and reconnection.
//!
//! Every `connect` owns a supervisor token. Cancelling it (new `connect`, `disconnect`, drop)
//! stops the running attempt and the link monitor. At most one attempt runs at a time: attempts
//! hold `handshake` for their whole duration.

use pipecall_protocol::{Channel, IceCandidate, SdpKind, SessionDescription};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::connectivity::{
    ConnectivityDriver, ConnectivityEngine, LinkState, LinkUpdate, MediaHandle, MediaSource,
};
use crate::error::NegotiationError;
use crate::events::{EventKind, NegotiationEvent};
use crate::http_retry::RetryPolicy;
use crate::lifetime::LifetimeTimer;
use crate::net_metrics::{NetMetrics, NetMetricsSnapshot};
use crate::relay_client::{RelayClient, SendOutcome};
use crate::session::{Phase, Role, Session, SessionError};

pub struct Negotiator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    relay: RelayClient,
    engine: Arc<dyn ConnectivityEngine>,
    media: Arc<dyn MediaSource>,
    session: Mutex<Session>,
    driver: tokio::sync::Mutex<Option<ConnectivityDriver>>,
    events: broadcast::Sender<NegotiationEvent>,
    generation: AtomicU64,
    handshake: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<CancellationToken>>,
}

/// State carried by one `connect` across its reconnection attempts.
struct Supervisor {
    keyword: String,
    token: CancellationToken,
    generation: u64,
    links_tx: mpsc::UnboundedSender<LinkUpdate>,
    links_rx: mpsc::UnboundedReceiver<LinkUpdate>,
}

impl Negotiator {
    pub fn new(
        settings: Settings,
        engine: Arc<dyn ConnectivityEngine>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        let relay = RelayClient::new(
            &settings.relay_url,
            RetryPolicy::new(settings.retry_attempts),
            Arc::new(NetMetrics::new()),
        );
        let (events, _) = broadcast::channel(128);
        Self {
            inner: Arc::new(Inner {
                settings,
                relay,
                engine,
                media,
                session: Mutex::new(Session::default()),
                driver: tokio::sync::Mutex::new(None),
                events,
                generation: AtomicU64::new(0),
                handshake: tokio::sync::Mutex::new(()),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NegotiationEvent> {
        self.inner.events.subscribe()
    }

    pub fn role(&self) -> Role {
        self.inner.session().role()
    }

    pub fn phase(&self) -> Phase {
        self.inner.session().phase()
    }

    pub fn connection_established(&self) -> bool {
        self.inner.session().link_established()
    }

    pub fn metrics(&self) -> NetMetricsSnapshot {
        self.inner.relay.metrics().snapshot()
    }

    /// Runs one handshake on `keyword` and returns once the link is up.
    ///
    /// Supersedes any attempt or connection already running on this instance. After success a
    /// background monitor reconnects on link loss until `disconnect`.
    pub async fn connect(&self, keyword: &str) -> Result<(), NegotiationError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(NegotiationError::InvalidKeyword);
        }

        let token = CancellationToken::new();
        let prev = self.inner.supervisor_slot().replace(token.clone());
        if let Some(prev) = prev {
            debug!("superseding previous connect");
            prev.cancel();
            self.inner.relay.abort_local();
        }

        let guard = self.inner.handshake.lock().await;
        if token.is_cancelled() {
            return Err(NegotiationError::Cancelled);
        }
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let mut sup = Supervisor {
            keyword: keyword.to_string(),
            token,
            generation: 0,
            links_tx,
            links_rx,
        };
        self.inner.run_attempt(&mut sup).await?;
        drop(guard);

        tokio::spawn(Arc::clone(&self.inner).supervise(sup));
        Ok(())
    }

    /// Stops whatever is running and releases the link. Calling it again is a no-op.
    pub async fn disconnect(&self) {
        let token = self.inner.supervisor_slot().take();
        if let Some(t) = &token {
            t.cancel();
        }
        self.inner.relay.abort_local();

        let _guard = self.inner.handshake.lock().await;
        let was_active = self.inner.teardown(false).await;
        if token.is_some() || was_active {
            info!("disconnected");
            self.inner.emit(EventKind::Disconnected);
        }
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        if let Some(t) = self.inner.supervisor_slot().take() {
            t.cancel();
        }
        self.inner.relay.abort_local();
    }
}

fn live(cancel: &CancellationToken) -> Result<(), NegotiationError> {
    if cancel.is_cancelled() {
        Err(NegotiationError::Cancelled)
    } else {
        Ok(())
    }
}

fn confirm(outcome: SendOutcome, path: &str, phase: Phase) -> Result<(), NegotiationError> {
    if outcome.success {
        Ok(())
    } else if outcome.timed_out {
        Err(NegotiationError::RelayTimeout {
            path: path.to_string(),
        })
    } else {
        Err(NegotiationError::handshake(phase, "relay did not confirm delivery"))
    }
}

fn session_error(e: SessionError) -> NegotiationError {
    match e {
        SessionError::Inactive => NegotiationError::Cancelled,
        SessionError::IllegalTransition { from, .. } => NegotiationError::handshake(from, e),
        SessionError::RoleFixed(_) => NegotiationError::handshake(Phase::HeadCheck, e),
    }
}

fn engine_error(phase: Phase) -> impl FnOnce(anyhow::Error) -> NegotiationError {
    move |e| NegotiationError::handshake(phase, format!("{e:#}"))
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn supervisor_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.supervisor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, kind: EventKind) {
        let _ = self.events.send(NegotiationEvent::new(kind));
    }

    fn advance(&self, to: Phase, message: &str) -> Result<(), NegotiationError> {
        let ctx = {
            let mut s = self.session();
            s.advance(to).map_err(session_error)?;
            s.log_ctx()
        };
        debug!(role = %ctx.role, phase = %ctx.phase, "{message}");
        self.emit(EventKind::Status {
            role: ctx.role,
            phase: ctx.phase,
            message: message.to_string(),
        });
        Ok(())
    }

    /// One full attempt: fresh session, role probe, handshake, candidate exchange, link up.
    /// Failures are reported and torn down here; the caller only decides what comes next.
    async fn run_attempt(self: &Arc<Self>, sup: &mut Supervisor) -> Result<Role, NegotiationError> {
        // Leftovers of a superseded connection.
        self.teardown(false).await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        sup.generation = generation;
        let cancel = sup.token.child_token();

        let media = match self.media.acquire().await {
            Ok(m) => m,
            Err(e) => {
                let err = NegotiationError::handshake(Phase::Idle, format!("media: {e:#}"));
                warn!(keyword = %sup.keyword, "{err}");
                self.emit(EventKind::Error {
                    phase: Phase::Idle,
                    message: err.describe(Phase::Idle),
                });
                return Err(err);
            }
        };

        let session = Session::start(&sup.keyword);
        self.relay.set_cancel_key(Some(session.token().to_string()));
        *self.session() = session;
        self.relay.metrics().session_started();
        info!(keyword = %sup.keyword, generation, media = %media.label, "negotiation started");

        let timer = LifetimeTimer::start(
            self.settings.lifetime,
            self.settings.tick,
            self.events.clone(),
        );
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
            _ = timer.expired() => Err(NegotiationError::LifetimeExpired),
            r = self.negotiate(&sup.keyword, generation, &media, &cancel, sup.links_tx.clone(), &mut sup.links_rx) => r,
        };
        timer.stop();

        if let Err(e) = &res {
            self.fail(e).await;
        }
        res
    }

    async fn fail(self: &Arc<Self>, err: &NegotiationError) {
        let ctx = self.session().log_ctx();
        if err.is_cancelled() {
            debug!(role = %ctx.role, phase = %ctx.phase, "attempt cancelled");
            self.teardown(false).await;
            return;
        }
        warn!(role = %ctx.role, phase = %ctx.phase, "negotiation failed: {err}");
        self.teardown(true).await;
        self.emit(EventKind::Error {
            phase: ctx.phase,
            message: err.describe(ctx.phase),
        });
    }

    /// Aborts local requests, asks the relay to drop our pending long-polls, closes the
    /// engine session and ends the Session. Returns whether a session was still active.
    async fn teardown(self: &Arc<Self>, failed: bool) -> bool {
        self.relay.abort_local();

        let (paths, key, was_active) = {
            let mut s = self.session();
            if s.is_active() {
                let ctx = s.log_ctx();
                let elapsed_ms = s.elapsed().as_millis() as u64;
                debug!(role = %ctx.role, phase = %ctx.phase, elapsed_ms, "ending session");
            }
            let paths: Vec<String> = s
                .pending_channels()
                .into_iter()
                .map(|c| s.path(c))
                .collect();
            let key = s.token().to_string();
            if failed && s.is_active() {
                let _ = s.advance(Phase::Failed);
            }
            (paths, key, s.end())
        };
        self.relay.set_cancel_key(None);

        if !paths.is_empty() && !key.is_empty() {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                for path in paths {
                    inner.relay.cancel_with_key(&path, &key).await;
                }
            });
        }

        let driver = self.driver.lock().await.take();
        if let Some(d) = driver {
            debug!(generation = d.generation(), "closing connectivity session");
            d.close().await;
        }
        was_active
    }

    async fn negotiate(
        self: &Arc<Self>,
        keyword: &str,
        generation: u64,
        media: &MediaHandle,
        cancel: &CancellationToken,
        links_tx: mpsc::UnboundedSender<LinkUpdate>,
        links_rx: &mut mpsc::UnboundedReceiver<LinkUpdate>,
    ) -> Result<Role, NegotiationError> {
        self.advance(Phase::HeadCheck, "probing relay for a waiting host")?;
        let offer_path = Channel::Offer.path(keyword);
        let role = if self.relay.exists(&offer_path).await {
            Role::Guest
        } else {
            Role::Host
        };
        live(cancel)?;
        self.session().set_role(role).map_err(session_error)?;
        info!(%role, keyword, "role decided");

        let driver = ConnectivityDriver::open(self.engine.as_ref(), media, generation, links_tx)
            .await
            .map_err(engine_error(Phase::HeadCheck))?;
        *self.driver.lock().await = Some(driver);

        if role == Role::Guest {
            self.guest_flow(keyword, cancel).await?;
        } else {
            self.host_flow(keyword, cancel).await?;
        }

        self.exchange_candidates(role, keyword, cancel).await?;
        self.advance(Phase::Connected, "candidates applied, waiting for link")?;
        wait_for_link(generation, links_rx).await?;
        self.session().mark_link_established().map_err(session_error)?;

        info!(%role, keyword, generation, "link established");
        self.emit(EventKind::Connected { role });
        Ok(role)
    }

    async fn host_flow(&self, keyword: &str, cancel: &CancellationToken) -> Result<(), NegotiationError> {
        self.advance(Phase::HOfferPut, "publishing offer, waiting for a guest")?;
        let offer = {
            let guard = self.driver.lock().await;
            let driver = guard.as_ref().ok_or(NegotiationError::Cancelled)?;
            driver
                .create_offer()
                .await
                .map_err(engine_error(Phase::HOfferPut))?
        };
        let path = Channel::Offer.path(keyword);
        let sent = self
            .relay
            .send(&path, &offer, keyword, self.settings.offer_timeout_secs)
            .await?;
        confirm(sent, &path, Phase::HOfferPut)?;

        self.advance(Phase::HAnswerGet, "guest took the offer, fetching answer")?;
        let path = Channel::Answer.path(keyword);
        let answer: SessionDescription = match self
            .relay
            .receive(&path, keyword, self.settings.short_timeout_secs)
            .await
        {
            Some(a) => a,
            None => {
                live(cancel)?;
                return Err(NegotiationError::handshake(Phase::HAnswerGet, "no answer from guest"));
            }
        };
        if answer.kind != SdpKind::Answer {
            return Err(NegotiationError::handshake(
                Phase::HAnswerGet,
                format!("expected an answer, got {:?}", answer.kind),
            ));
        }
        {
            let guard = self.driver.lock().await;
            let driver = guard.as_ref().ok_or(NegotiationError::Cancelled)?;
            driver
                .apply_answer(answer)
                .await
                .map_err(engine_error(Phase::HAnswerGet))?;
        }
        self.advance(Phase::HIceExchange, "exchanging candidates")
    }

    async fn guest_flow(&self, keyword: &str, cancel: &CancellationToken) -> Result<(), NegotiationError> {
        self.advance(Phase::GOfferGet, "fetching offer")?;
        let path = Channel::Offer.path(keyword);
        let offer: SessionDescription = match self
            .relay
            .receive(&path, keyword, self.settings.short_timeout_secs)
            .await
        {
            Some(o) => o,
            None => {
                live(cancel)?;
                return Err(NegotiationError::NoPeerFound {
                    keyword: keyword.to_string(),
                });
            }
        };
        if offer.kind != SdpKind::Offer {
            return Err(NegotiationError::handshake(
                Phase::GOfferGet,
                format!("expected an offer, got {:?}", offer.kind),
            ));
        }

        self.advance(Phase::GAnswerPut, "publishing answer")?;
        let answer = {
            let guard = self.driver.lock().await;
            let driver = guard.as_ref().ok_or(NegotiationError::Cancelled)?;
            driver
                .accept_offer(offer)
                .await
                .map_err(engine_error(Phase::GAnswerPut))?
        };
        let path = Channel::Answer.path(keyword);
        let sent = self
            .relay
            .send(&path, &answer, keyword, self.settings.short_timeout_secs)
            .await?;
        confirm(sent, &path, Phase::GAnswerPut)?;
        self.advance(Phase::GIceExchange, "exchanging candidates")
    }

    /// Batch-then-send. Our PUT and the peer GET run together and both must succeed before
    /// a single remote candidate reaches the engine.
    async fn exchange_candidates(
        &self,
        role: Role,
        keyword: &str,
        cancel: &CancellationToken,
    ) -> Result<(), NegotiationError> {
        let phase = self.session().phase();
        let (own, peer) = match (role.own_ice(), role.peer_ice()) {
            (Some(o), Some(p)) => (o, p),
            _ => return Err(NegotiationError::handshake(phase, "role undetermined")),
        };

        let local = {
            let mut guard = self.driver.lock().await;
            let driver = guard.as_mut().ok_or(NegotiationError::Cancelled)?;
            driver.gather_candidates(self.settings.gather_timeout).await
        };
        if local.is_empty() {
            return Err(NegotiationError::handshake(phase, "no local candidates gathered"));
        }

        let own_path = own.path(keyword);
        let peer_path = peer.path(keyword);
        let short = self.settings.short_timeout_secs;
        let (sent, received) = tokio::join!(
            self.relay.send(&own_path, &local, keyword, short),
            self.relay.receive::<Vec<IceCandidate>>(&peer_path, keyword, short),
        );
        confirm(sent?, &own_path, phase)?;
        let remote = match received {
            Some(r) => r,
            None => {
                live(cancel)?;
                return Err(NegotiationError::handshake(phase, "no candidates from peer"));
            }
        };

        let received = remote.len();
        let applied = {
            let guard = self.driver.lock().await;
            let driver = guard.as_ref().ok_or(NegotiationError::Cancelled)?;
            driver.add_candidates(remote).await
        };
        info!(%role, %phase, sent = local.len(), received, applied, "candidates exchanged");
        Ok(())
    }

    /// Watches the link of the current generation and reconnects when it drops.
    async fn supervise(self: Arc<Self>, mut sup: Supervisor) {
        loop {
            let update = tokio::select! {
                _ = sup.token.cancelled() => return,
                u = sup.links_rx.recv() => u,
            };
            let Some(update) = update else { return };
            if update.generation != sup.generation || !update.state.is_lost() {
                continue;
            }
            let ctx = self.session().log_ctx();
            if !self.session().link_established() {
                continue;
            }
            warn!(role = %ctx.role, phase = %ctx.phase, state = %update.state, "link lost");

            {
                let _guard = tokio::select! {
                    _ = sup.token.cancelled() => return,
                    g = self.handshake.lock() => g,
                };
                if sup.token.is_cancelled() {
                    return;
                }
                self.teardown(false).await;
            }

            if !self.settings.auto_reconnect || self.settings.max_reconnect_attempts == 0 {
                self.emit(EventKind::Error {
                    phase: ctx.phase,
                    message: NegotiationError::LinkLost.describe(ctx.phase),
                });
                self.emit(EventKind::Disconnected);
                return;
            }
            if !self.reconnect(&mut sup).await {
                return;
            }
        }
    }

    /// Bounded retries of the full handshake. Returns true once a retry connected.
    async fn reconnect(self: &Arc<Self>, sup: &mut Supervisor) -> bool {
        let max = self.settings.max_reconnect_attempts;
        for attempt in 1..=max {
            info!(attempt, max, keyword = %sup.keyword, "reconnecting");
            self.emit(EventKind::Reconnecting {
                attempt,
                max_attempts: max,
            });
            tokio::select! {
                _ = sup.token.cancelled() => return false,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }

            let _guard = tokio::select! {
                _ = sup.token.cancelled() => return false,
                g = self.handshake.lock() => g,
            };
            if sup.token.is_cancelled() {
                return false;
            }
            match self.run_attempt(sup).await {
                Ok(role) => {
                    info!(attempt, %role, "reconnected");
                    self.emit(EventKind::Reconnected { role, attempt });
                    return true;
                }
                Err(NegotiationError::Cancelled) => return false,
                Err(e) => warn!(attempt, max, "reconnect attempt failed: {e}"),
            }
        }

        let err = NegotiationError::ReconnectFailed { attempts: max };
        warn!(keyword = %sup.keyword, "{err}");
        self.emit(EventKind::ReconnectFailed { attempts: max });
        self.emit(EventKind::Error {
            phase: Phase::Idle,
            message: err.describe(Phase::Idle),
        });
        false
    }
}

async fn wait_for_link(
    generation: u64,
    links_rx: &mut mpsc::UnboundedReceiver<LinkUpdate>,
) -> Result<(), NegotiationError> {
    while let Some(update) = links_rx.recv().await {
        if update.generation != generation {
            continue;
        }
        match update.state {
            LinkState::Connected => return Ok(()),
            s if s.is_lost() => {
                return Err(NegotiationError::handshake(
                    Phase::Connected,
                    format!("link went {s} before connecting"),
                ))
            }
            _ => {}
        }
    }
    Err(NegotiationError::Cancelled)
}
