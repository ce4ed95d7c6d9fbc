/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;

use crate::session::{Phase, Role};

fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Status {
        role: Role,
        phase: Phase,
        message: String,
    },
    TimeRemaining {
        secs: u64,
    },
    Connected {
        role: Role,
    },
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
    },
    Reconnected {
        role: Role,
        attempt: u32,
    },
    ReconnectFailed {
        attempts: u32,
    },
    Disconnected,
    Error {
        phase: Phase,
        message: String,
    },
}

/// Everything the negotiator reports outward (status, timer and error callbacks).
#[derive(Clone, Debug, Serialize)]
pub struct NegotiationEvent {
    pub ts_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl NegotiationEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            ts_ms: now_ms_u64(),
            kind,
        }
    }
}
