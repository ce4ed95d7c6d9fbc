/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use crate::events::{EventKind, NegotiationEvent};

/// Countdown for one handshake attempt. Ticks `TimeRemaining` and trips `expired` at zero.
///
/// Dropping the timer stops it.
pub struct LifetimeTimer {
    expired: CancellationToken,
    task: JoinHandle<()>,
}

impl LifetimeTimer {
    pub fn start(
        lifetime: Duration,
        tick: Duration,
        events: broadcast::Sender<NegotiationEvent>,
    ) -> Self {
        let expired = CancellationToken::new();
        let deadline = Instant::now() + lifetime;
        let task = {
            let expired = expired.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(tick);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let until = tokio::time::sleep_until(deadline);
                tokio::pin!(until);
                loop {
                    tokio::select! {
                        _ = &mut until => break,
                        _ = ticker.tick() => {
                            let secs = deadline.saturating_duration_since(Instant::now()).as_secs();
                            let _ = events.send(NegotiationEvent::new(EventKind::TimeRemaining { secs }));
                        }
                    }
                }
                debug!(lifetime_secs = lifetime.as_secs(), "session lifetime elapsed");
                let _ = events.send(NegotiationEvent::new(EventKind::TimeRemaining { secs: 0 }));
                expired.cancel();
            })
        };
        Self { expired, task }
    }

    /// Resolves once the lifetime has elapsed. Never resolves after [`stop`](Self::stop).
    pub fn expired(&self) -> WaitForCancellationFuture<'_> {
        self.expired.cancelled()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for LifetimeTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_down_then_expires() {
        let (tx, mut rx) = broadcast::channel(128);
        let timer = LifetimeTimer::start(Duration::from_secs(3), Duration::from_secs(1), tx);
        timer.expired().await;

        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let EventKind::TimeRemaining { secs } = ev.kind {
                seen.push(secs);
            }
        }
        assert_eq!(seen.first(), Some(&3));
        assert_eq!(seen.last(), Some(&0));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_expiry() {
        let (tx, _rx) = broadcast::channel(128);
        let timer = LifetimeTimer::start(Duration::from_secs(2), Duration::from_secs(1), tx);
        timer.stop();
        let fired = tokio::time::timeout(Duration::from_secs(5), timer.expired()).await;
        assert!(fired.is_err());
    }
}
