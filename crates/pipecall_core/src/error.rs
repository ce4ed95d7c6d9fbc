/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::relay_client::RelayError;
use crate::session::Phase;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("relay request failed (status {status:?}): {message}")]
    Transport { status: Option<u16>, message: String },
    #[error("relay timed out waiting on {path}")]
    RelayTimeout { path: String },
    #[error("session lifetime expired")]
    LifetimeExpired,
    #[error("no host is waiting on '{keyword}'")]
    NoPeerFound { keyword: String },
    #[error("handshake failed in {phase}: {reason}")]
    HandshakeFailed { phase: Phase, reason: String },
    #[error("link to peer lost")]
    LinkLost,
    #[error("reconnection failed after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },
    #[error("cancelled")]
    Cancelled,
    #[error("keyword must not be empty")]
    InvalidKeyword,
}

impl NegotiationError {
    pub fn handshake(phase: Phase, reason: impl std::fmt::Display) -> Self {
        NegotiationError::HandshakeFailed {
            phase,
            reason: reason.to_string(),
        }
    }

    /// Intentional teardown, never shown to the user.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NegotiationError::Cancelled)
    }

    /// Human readable message qualified with the phase it happened in.
    pub fn describe(&self, phase: Phase) -> String {
        match self {
            NegotiationError::HandshakeFailed { .. } => self.to_string(),
            _ => format!("[{phase}] {self}"),
        }
    }
}

impl From<RelayError> for NegotiationError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Cancelled => NegotiationError::Cancelled,
            other => NegotiationError::Transport {
                status: other.status(),
                message: other.to_string(),
            },
        }
    }
}
