/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Long-poll window hint, in whole seconds.
pub const HEADER_TIMEOUT: &str = "X-Timeout";
/// Credential that lets the registering party abort its own pending PUT/GET.
pub const HEADER_CANCEL_KEY: &str = "X-Cancel-Key";

pub const MARKER_OK: &str = "[OK]";
pub const MARKER_TIMEOUT: &str = "[TIMEOUT]";

/// The four relay slots used by one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Offer,
    Answer,
    IceHost,
    IceGuest,
}

impl Channel {
    pub fn suffix(self) -> &'static str {
        match self {
            Channel::Offer => "offer",
            Channel::Answer => "answer",
            Channel::IceHost => "ice-host",
            Channel::IceGuest => "ice-guest",
        }
    }

    pub fn path(self, keyword: &str) -> String {
        format!("{keyword}/{}", self.suffix())
    }

    /// Candidate channel written by the host (`true`) or the guest (`false`).
    pub fn ice_for(host: bool) -> Self {
        if host {
            Channel::IceHost
        } else {
            Channel::IceGuest
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Same JSON shape as a browser `RTCSessionDescription`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Same JSON shape as a browser `RTCIceCandidate.toJSON()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}
