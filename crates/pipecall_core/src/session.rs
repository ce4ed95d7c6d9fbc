/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use pipecall_protocol::Channel;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Undetermined,
    Host,
    Guest,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
            Role::Undetermined => Role::Undetermined,
        }
    }

    /// Candidate channel this role writes to.
    pub fn own_ice(self) -> Option<Channel> {
        match self {
            Role::Host => Some(Channel::ice_for(true)),
            Role::Guest => Some(Channel::ice_for(false)),
            Role::Undetermined => None,
        }
    }

    /// Candidate channel this role reads from.
    pub fn peer_ice(self) -> Option<Channel> {
        self.peer().own_ice()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Undetermined => "undetermined",
            Role::Host => "host",
            Role::Guest => "guest",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    HeadCheck,
    HOfferPut,
    HAnswerGet,
    HIceExchange,
    GOfferGet,
    GAnswerPut,
    GIceExchange,
    Connected,
    Failed,
}

impl Phase {
    fn can_advance_to(self, to: Phase) -> bool {
        use Phase::*;
        if matches!(to, Idle | Failed) {
            return true;
        }
        matches!(
            (self, to),
            (Idle, HeadCheck)
                | (HeadCheck, HOfferPut)
                | (HOfferPut, HAnswerGet)
                | (HAnswerGet, HIceExchange)
                | (HIceExchange, Connected)
                | (HeadCheck, GOfferGet)
                | (GOfferGet, GAnswerPut)
                | (GAnswerPut, GIceExchange)
                | (GIceExchange, Connected)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "IDLE",
            Phase::HeadCheck => "HEAD_CHECK",
            Phase::HOfferPut => "H_OFFER_PUT",
            Phase::HAnswerGet => "H_ANSWER_GET",
            Phase::HIceExchange => "H_ICE_EXCHANGE",
            Phase::GOfferGet => "G_OFFER_GET",
            Phase::GAnswerPut => "G_ANSWER_PUT",
            Phase::GIceExchange => "G_ICE_EXCHANGE",
            Phase::Connected => "CONNECTED",
            Phase::Failed => "FAILED",
        })
    }
}

/// Explicit logging context, handed to log calls instead of reading shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCtx {
    pub role: Role,
    pub phase: Phase,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },
    #[error("role already fixed to {0}")]
    RoleFixed(Role),
    #[error("session is not active")]
    Inactive,
}

/// One negotiation attempt.
#[derive(Debug, Clone)]
pub struct Session {
    phase: Phase,
    role: Role,
    keyword: String,
    token: String,
    started_at: Option<Instant>,
    active: bool,
    link_established: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            role: Role::Undetermined,
            keyword: String::new(),
            token: String::new(),
            started_at: None,
            active: false,
            link_established: false,
        }
    }
}

impl Session {
    pub fn start(keyword: &str) -> Self {
        Self {
            keyword: keyword.to_string(),
            token: random_token(),
            started_at: Some(Instant::now()),
            active: true,
            ..Self::default()
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn link_established(&self) -> bool {
        self.link_established
    }

    pub fn log_ctx(&self) -> LogCtx {
        LogCtx {
            role: self.role,
            phase: self.phase,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn path(&self, channel: Channel) -> String {
        channel.path(&self.keyword)
    }

    pub fn set_role(&mut self, role: Role) -> Result<(), SessionError> {
        if !self.active {
            return Err(SessionError::Inactive);
        }
        if self.role != Role::Undetermined && self.role != role {
            return Err(SessionError::RoleFixed(self.role));
        }
        self.role = role;
        Ok(())
    }

    pub fn advance(&mut self, to: Phase) -> Result<(), SessionError> {
        if !self.active && !matches!(to, Phase::Idle | Phase::Failed) {
            return Err(SessionError::Inactive);
        }
        if !self.phase.can_advance_to(to) {
            return Err(SessionError::IllegalTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Only meaningful once the handshake reached `Connected`.
    pub fn mark_link_established(&mut self) -> Result<(), SessionError> {
        if !self.active {
            return Err(SessionError::Inactive);
        }
        if self.phase != Phase::Connected {
            return Err(SessionError::IllegalTransition {
                from: self.phase,
                to: Phase::Connected,
            });
        }
        self.link_established = true;
        Ok(())
    }

    /// Channels on which this session may still hold a long-poll on the relay.
    pub fn pending_channels(&self) -> Vec<Channel> {
        match self.phase {
            Phase::HOfferPut | Phase::GOfferGet => vec![Channel::Offer],
            Phase::HAnswerGet | Phase::GAnswerPut => vec![Channel::Answer],
            Phase::HIceExchange | Phase::GIceExchange => {
                self.role.own_ice().into_iter().chain(self.role.peer_ice()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Marks the session finished and returns it to `Idle`. Returns false when it already was.
    pub fn end(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.link_established = false;
        self.phase = Phase::Idle;
        true
    }
}

fn random_token() -> String {
    let mut b = [0u8; 16];
    use rand::RngCore as _;
    rand::rngs::OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}
