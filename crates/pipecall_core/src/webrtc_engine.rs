/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use pipecall_protocol::{IceCandidate, SdpKind, SessionDescription};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::config::Settings;
use crate::connectivity::{
    ConnectivityEngine, ConnectivitySession, EngineEvent, LinkState, MediaHandle,
};

/// Label of the data channel the offerer opens.
pub const DATA_CHANNEL_LABEL: &str = "pipecall";

/// Local tracks a [`crate::connectivity::MediaSource`] can hand over inside a [`MediaHandle`].
pub struct LocalTracks(pub Vec<Arc<dyn TrackLocal + Send + Sync>>);

pub struct WebrtcEngine {
    ice_servers: Vec<RTCIceServer>,
}

impl WebrtcEngine {
    pub fn new(settings: &Settings) -> Self {
        Self {
            ice_servers: build_ice_servers(settings),
        }
    }
}

fn build_ice_servers(settings: &Settings) -> Vec<RTCIceServer> {
    if settings.ice_urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: settings.ice_urls.clone(),
        username: settings.ice_username.clone().unwrap_or_default(),
        credential: settings.ice_credential.clone().unwrap_or_default(),
        ..Default::default()
    }]
}

async fn new_peer_connection(ice_servers: Vec<RTCIceServer>) -> Result<Arc<RTCPeerConnection>> {
    let mut media = MediaEngine::default();
    media.register_default_codecs().context("register codecs")?;
    let registry = register_default_interceptors(Registry::new(), &mut media)
        .context("register interceptors")?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();
    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await
        .context("new peer connection")?;
    Ok(Arc::new(pc))
}

fn link_state(st: RTCPeerConnectionState) -> Option<LinkState> {
    Some(match st {
        RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => return None,
    })
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).context("parse remote offer"),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).context("parse remote answer"),
    }
}

fn to_rtc_candidate(c: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment.filter(|s| !s.is_empty()),
    }
}

#[async_trait]
impl ConnectivityEngine for WebrtcEngine {
    async fn create_session(
        &self,
        media: &MediaHandle,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn ConnectivitySession>> {
        let pc = new_peer_connection(self.ice_servers.clone()).await?;

        if let Some(tracks) = media.downcast::<LocalTracks>() {
            for track in &tracks.0 {
                pc.add_track(Arc::clone(track)).await.context("add local track")?;
            }
            debug!(media = %media.label, tracks = tracks.0.len(), "local tracks attached");
        }

        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |cand| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(cand) = cand else {
                        let _ = events.send(EngineEvent::GatheringComplete);
                        return;
                    };
                    match cand.to_json() {
                        Ok(init) => {
                            let _ = events.send(EngineEvent::Candidate(from_rtc_candidate(init)));
                        }
                        Err(e) => warn!("webrtc candidate not serializable: {e:#}"),
                    }
                })
            }));
        }
        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    if let Some(state) = link_state(st) {
                        let _ = events.send(EngineEvent::LinkState(state));
                    }
                })
            }));
        }

        Ok(Arc::new(WebrtcSession {
            pc,
            data_channel: Mutex::new(None),
        }))
    }
}

struct WebrtcSession {
    pc: Arc<RTCPeerConnection>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
}

#[async_trait]
impl ConnectivitySession for WebrtcSession {
    async fn create_offer(&self) -> Result<SessionDescription> {
        // An offer without an m-line has nothing to gather candidates for.
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .context("create data channel")?;
        *self.data_channel.lock().unwrap_or_else(|e| e.into_inner()) = Some(dc);

        let offer = self.pc.create_offer(None).await.context("create offer")?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .context("set local offer")?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.context("create answer")?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .context("set local answer")?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .context("set remote description")
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .context("add ice candidate")
    }

    async fn close(&self) {
        let dc = self.data_channel.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(dc) = dc {
            let _ = dc.close().await;
        }
        if let Err(e) = self.pc.close().await {
            warn!("webrtc close failed: {e:#}");
        }
    }
}
