/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Shared test infrastructure for the pipecall integration tests
//!
//! Provides:
//! - TestRelay: in-process blocking relay (PUT parks until a GET takes it)
//! - MockEngine: scripted connectivity engine
//! - helpers for settings and event waiting

#![allow(dead_code)]

use std::time::Duration;

use pipecall_core::config::NegotiatorConfig;
use pipecall_core::{EventKind, NegotiationEvent, Settings};
use tokio::sync::broadcast;

pub mod test_relay {
    use axum::body::Bytes;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, Method, StatusCode};
    use axum::routing::any;
    use axum::Router;
    use pipecall_protocol::{HEADER_CANCEL_KEY, HEADER_TIMEOUT, MARKER_OK, MARKER_TIMEOUT};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    #[derive(Clone, Debug)]
    pub struct LoggedRequest {
        pub method: String,
        pub path: String,
        pub cancel_key: Option<String>,
        pub timeout: Option<String>,
        pub body: String,
    }

    enum Slot {
        Sender {
            id: u64,
            key: Option<String>,
            body: String,
            done: oneshot::Sender<()>,
        },
        Receiver {
            id: u64,
            key: Option<String>,
            tx: oneshot::Sender<String>,
        },
    }

    impl Slot {
        fn id(&self) -> u64 {
            match self {
                Slot::Sender { id, .. } | Slot::Receiver { id, .. } => *id,
            }
        }

        fn key(&self) -> Option<&str> {
            match self {
                Slot::Sender { key, .. } | Slot::Receiver { key, .. } => key.as_deref(),
            }
        }
    }

    struct Failure {
        status: u16,
        remaining: Option<u32>,
    }

    #[derive(Default)]
    struct RelayState {
        slots: Mutex<HashMap<String, Slot>>,
        log: Mutex<Vec<LoggedRequest>>,
        failures: Mutex<HashMap<(String, String), Failure>>,
        forced: Mutex<HashSet<String>>,
        next_id: AtomicU64,
    }

    impl RelayState {
        fn take_failure(&self, method: &str, path: &str) -> Option<u16> {
            let mut failures = self.failures.lock().unwrap();
            let key = (method.to_string(), path.to_string());
            let f = failures.get_mut(&key)?;
            let status = f.status;
            let exhausted = match &mut f.remaining {
                None => false,
                Some(0) => true,
                Some(n) => {
                    *n -= 1;
                    false
                }
            };
            if exhausted {
                failures.remove(&key);
                return None;
            }
            Some(status)
        }

        fn remove_if(&self, path: &str, id: u64) {
            let mut slots = self.slots.lock().unwrap();
            if slots.get(path).map(Slot::id) == Some(id) {
                slots.remove(path);
            }
        }
    }

    /// Minimal piping-server style relay on 127.0.0.1.
    pub struct TestRelay {
        pub url: String,
        state: Arc<RelayState>,
        task: JoinHandle<()>,
    }

    impl TestRelay {
        pub async fn start() -> Self {
            let state = Arc::new(RelayState::default());
            let app = Router::new()
                .route("/*path", any(handle))
                .with_state(state.clone());
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let task = tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            Self {
                url: format!("http://{addr}"),
                state,
                task,
            }
        }

        pub fn requests(&self) -> Vec<LoggedRequest> {
            self.state.log.lock().unwrap().clone()
        }

        pub fn requests_for(&self, method: &str, path: &str) -> Vec<LoggedRequest> {
            self.requests()
                .into_iter()
                .filter(|r| r.method == method && r.path == path)
                .collect()
        }

        /// Every `method` request on `path` answers `status` without touching the relay state.
        pub fn fail(&self, method: &str, path: &str, status: u16) {
            self.state.failures.lock().unwrap().insert(
                (method.to_string(), path.to_string()),
                Failure {
                    status,
                    remaining: None,
                },
            );
        }

        /// Like [`fail`](Self::fail), for the next `times` requests only.
        pub fn fail_times(&self, method: &str, path: &str, status: u16, times: u32) {
            self.state.failures.lock().unwrap().insert(
                (method.to_string(), path.to_string()),
                Failure {
                    status,
                    remaining: Some(times),
                },
            );
        }

        /// HEAD on `path` answers 200 even with nothing parked.
        pub fn force_exists(&self, path: &str) {
            self.state.forced.lock().unwrap().insert(path.to_string());
        }

        pub fn has_pending_sender(&self, path: &str) -> bool {
            matches!(self.state.slots.lock().unwrap().get(path), Some(Slot::Sender { .. }))
        }

        pub async fn wait_for_pending(&self, path: &str) -> bool {
            for _ in 0..100 {
                if self.has_pending_sender(path) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            false
        }

        pub async fn wait_for_request(&self, method: &str, path: &str) -> Option<LoggedRequest> {
            for _ in 0..100 {
                if let Some(r) = self.requests_for(method, path).into_iter().next() {
                    return Some(r);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            None
        }
    }

    impl Drop for TestRelay {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    async fn handle(
        State(relay): State<Arc<RelayState>>,
        method: Method,
        Path(path): Path<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> (StatusCode, String) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let cancel_key = header(HEADER_CANCEL_KEY);
        let timeout_hdr = header(HEADER_TIMEOUT);
        let body = String::from_utf8_lossy(&body).to_string();
        relay.log.lock().unwrap().push(LoggedRequest {
            method: method.to_string(),
            path: path.clone(),
            cancel_key: cancel_key.clone(),
            timeout: timeout_hdr.clone(),
            body: body.clone(),
        });

        if let Some(status) = relay.take_failure(method.as_str(), &path) {
            let status = StatusCode::from_u16(status).unwrap();
            return (status, "injected failure".to_string());
        }

        let timeout = Duration::from_secs(
            timeout_hdr
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
        );
        match method {
            Method::HEAD => {
                let parked = matches!(
                    relay.slots.lock().unwrap().get(&path),
                    Some(Slot::Sender { .. })
                );
                if parked || relay.forced.lock().unwrap().contains(&path) {
                    (StatusCode::OK, String::new())
                } else {
                    (StatusCode::NOT_FOUND, String::new())
                }
            }
            Method::PUT => put(&relay, path, cancel_key, body, timeout).await,
            Method::GET => get(&relay, path, cancel_key, timeout).await,
            Method::DELETE => delete(&relay, &path, cancel_key),
            _ => (StatusCode::METHOD_NOT_ALLOWED, String::new()),
        }
    }

    async fn put(
        relay: &RelayState,
        path: String,
        key: Option<String>,
        body: String,
        timeout: Duration,
    ) -> (StatusCode, String) {
        let (id, done_rx) = {
            let mut slots = relay.slots.lock().unwrap();
            let mut body = body;
            match slots.remove(&path) {
                Some(Slot::Receiver { tx, .. }) => match tx.send(body) {
                    Ok(()) => return (StatusCode::OK, MARKER_OK.to_string()),
                    Err(b) => body = b,
                },
                Some(sender) => {
                    slots.insert(path, sender);
                    return (StatusCode::CONFLICT, "path busy".to_string());
                }
                None => {}
            }
            let id = relay.next_id.fetch_add(1, Ordering::SeqCst);
            let (done, done_rx) = oneshot::channel();
            slots.insert(
                path.clone(),
                Slot::Sender {
                    id,
                    key,
                    body,
                    done,
                },
            );
            (id, done_rx)
        };
        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(())) => (StatusCode::OK, MARKER_OK.to_string()),
            Ok(Err(_)) => (StatusCode::GONE, "cancelled".to_string()),
            Err(_) => {
                relay.remove_if(&path, id);
                (StatusCode::OK, MARKER_TIMEOUT.to_string())
            }
        }
    }

    async fn get(
        relay: &RelayState,
        path: String,
        key: Option<String>,
        timeout: Duration,
    ) -> (StatusCode, String) {
        let (id, rx) = {
            let mut slots = relay.slots.lock().unwrap();
            if let Some(Slot::Sender { body, done, .. }) = slots.remove(&path) {
                let _ = done.send(());
                return (StatusCode::OK, body);
            }
            // A newer receiver replaces a stale one.
            let id = relay.next_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            slots.insert(path.clone(), Slot::Receiver { id, key, tx });
            (id, rx)
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => (StatusCode::OK, body),
            Ok(Err(_)) => (StatusCode::GONE, String::new()),
            Err(_) => {
                relay.remove_if(&path, id);
                (StatusCode::OK, MARKER_TIMEOUT.to_string())
            }
        }
    }

    fn delete(relay: &RelayState, path: &str, key: Option<String>) -> (StatusCode, String) {
        let Some(key) = key else {
            return (StatusCode::BAD_REQUEST, "missing cancel key".to_string());
        };
        let mut slots = relay.slots.lock().unwrap();
        if slots.get(path).and_then(Slot::key) == Some(key.as_str()) {
            slots.remove(path);
            (StatusCode::OK, "cancelled".to_string())
        } else {
            (StatusCode::NOT_FOUND, String::new())
        }
    }
}

pub mod mock_engine {
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use pipecall_core::connectivity::{
        ConnectivityEngine, ConnectivitySession, EngineEvent, LinkState, MediaHandle,
    };
    use pipecall_protocol::{IceCandidate, SdpKind, SessionDescription};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    pub fn mock_candidate(label: &str, i: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{i} 1 udp 2122260223 10.0.0.{i} 5{i}000 typ host {label}"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Engine whose sessions gather two fixed candidates and report `Connected` once the
    /// first remote candidate is added.
    #[derive(Clone)]
    pub struct MockEngine {
        label: String,
        gather: bool,
        sessions: Arc<Mutex<Vec<Arc<MockSession>>>>,
    }

    impl MockEngine {
        pub fn new(label: &str) -> Self {
            Self {
                label: label.to_string(),
                gather: true,
                sessions: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Sessions never produce a candidate.
        pub fn without_candidates(label: &str) -> Self {
            Self {
                gather: false,
                ..Self::new(label)
            }
        }

        pub fn expected_candidates(&self) -> Vec<IceCandidate> {
            (0..2).map(|i| mock_candidate(&self.label, i)).collect()
        }

        pub fn sessions(&self) -> Vec<Arc<MockSession>> {
            self.sessions.lock().unwrap().clone()
        }

        pub fn latest(&self) -> Option<Arc<MockSession>> {
            self.sessions.lock().unwrap().last().cloned()
        }

        /// Reports a link drop on the newest session.
        pub fn drop_link(&self) -> bool {
            match self.latest() {
                Some(s) => s.events.send(EngineEvent::LinkState(LinkState::Disconnected)).is_ok(),
                None => false,
            }
        }
    }

    #[async_trait]
    impl ConnectivityEngine for MockEngine {
        async fn create_session(
            &self,
            _media: &MediaHandle,
            events: mpsc::UnboundedSender<EngineEvent>,
        ) -> Result<Arc<dyn ConnectivitySession>> {
            let mut sessions = self.sessions.lock().unwrap();
            let session = Arc::new(MockSession {
                label: self.label.clone(),
                index: sessions.len(),
                gather: self.gather,
                events,
                local: Mutex::new(None),
                remote: Mutex::new(None),
                applied: Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            });
            sessions.push(session.clone());
            Ok(session)
        }
    }

    pub struct MockSession {
        label: String,
        index: usize,
        gather: bool,
        events: mpsc::UnboundedSender<EngineEvent>,
        local: Mutex<Option<SessionDescription>>,
        remote: Mutex<Option<SessionDescription>>,
        applied: Mutex<Vec<IceCandidate>>,
        connected: AtomicBool,
        closed: AtomicBool,
    }

    impl MockSession {
        pub fn local(&self) -> Option<SessionDescription> {
            self.local.lock().unwrap().clone()
        }

        pub fn remote(&self) -> Option<SessionDescription> {
            self.remote.lock().unwrap().clone()
        }

        pub fn applied(&self) -> Vec<IceCandidate> {
            self.applied.lock().unwrap().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn start_gathering(&self) {
            let _ = self.events.send(EngineEvent::LinkState(LinkState::Connecting));
            if self.gather {
                for i in 0..2 {
                    let _ = self
                        .events
                        .send(EngineEvent::Candidate(mock_candidate(&self.label, i)));
                }
            }
            let _ = self.events.send(EngineEvent::GatheringComplete);
        }

        fn sdp(&self, kind: &str) -> String {
            format!("v=0\r\no=mock-{}-{} {kind}\r\n", self.label, self.index)
        }
    }

    #[async_trait]
    impl ConnectivitySession for MockSession {
        async fn create_offer(&self) -> Result<SessionDescription> {
            let offer = SessionDescription::offer(self.sdp("offer"));
            *self.local.lock().unwrap() = Some(offer.clone());
            self.start_gathering();
            Ok(offer)
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            match self.remote() {
                Some(d) if d.kind == SdpKind::Offer => {}
                _ => bail!("no remote offer applied"),
            }
            let answer = SessionDescription::answer(self.sdp("answer"));
            *self.local.lock().unwrap() = Some(answer.clone());
            self.start_gathering();
            Ok(answer)
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
            *self.remote.lock().unwrap() = Some(desc);
            Ok(())
        }

        async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.applied.lock().unwrap().push(candidate);
            if !self.connected.swap(true, Ordering::SeqCst) {
                let _ = self.events.send(EngineEvent::LinkState(LinkState::Connected));
            }
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            let _ = self.events.send(EngineEvent::LinkState(LinkState::Closed));
        }
    }
}

/// Short windows so failure paths finish in a couple of seconds.
pub fn fast_settings(relay_url: &str) -> Settings {
    NegotiatorConfig {
        relay_url: Some(relay_url.to_string()),
        offer_timeout_secs: Some(10),
        short_timeout_secs: Some(2),
        gather_timeout_secs: Some(1),
        lifetime_secs: Some(20),
        tick_secs: Some(1),
        max_reconnect_attempts: Some(3),
        reconnect_delay_ms: Some(100),
        auto_reconnect: Some(true),
        retry_attempts: Some(1),
        ice_urls: Some(Vec::new()),
        ..Default::default()
    }
    .resolve()
}

/// Next event matching `pred`, or None once `within` elapsed.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<NegotiationEvent>,
    within: Duration,
    mut pred: F,
) -> Option<NegotiationEvent>
where
    F: FnMut(&EventKind) -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(ev)) if pred(&ev.kind) => return Some(ev),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// Drains whatever is queued right now.
pub fn drain_events(rx: &mut broadcast::Receiver<NegotiationEvent>) -> Vec<EventKind> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => out.push(ev.kind),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}
