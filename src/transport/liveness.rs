//! Keepalive-based liveness detection.
//!
//! WebSocket peers behind proxies can go half-open without either side
//! noticing. The monitor sends a keepalive every `keepalive_interval` and
//! asks the connection to force-close the socket once no inbound traffic of
//! any kind has been seen for `keepalive_interval + grace_margin`.
//!
//! # State Machine
//!
//! ```text
//!            tick, no traffic since last tick
//!  Active ─────────────────────────────────► Silent
//!    ▲                                         │
//!    └───────────── any inbound frame ─────────┘
//!
//!  Active | Silent ── silence timeout / socket not open / stop() ──► Closed
//! ```
//!
//! The monitor never owns the socket. It reports [`LivenessAction`]s and the
//! event loop performs them; a forced close surfaces as an ordinary close.
//! It runs from the moment the connection starts, so a socket that is still
//! opening at the first tick is given up on.

// ============================================================================
// Imports
// ============================================================================

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep};
use tracing::{debug, trace};

use super::config::{ConnectionConfig, millis};

// ============================================================================
// Types
// ============================================================================

/// Liveness state of the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// Traffic observed since the last keepalive tick.
    Active,
    /// A keepalive tick passed without inbound traffic.
    Silent,
    /// Timers cancelled; no further actions.
    Closed,
}

/// Action the event loop must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    /// Send a keepalive token to the peer.
    SendKeepalive,
    /// Close the socket; the peer is gone or the socket is unusable.
    ForceClose,
}

/// The two timers, dropped together on close.
struct Timers {
    keepalive: Interval,
    silence: Pin<Box<Sleep>>,
}

// ============================================================================
// LivenessMonitor
// ============================================================================

/// Keepalive sender and silence detector for one connection.
pub struct LivenessMonitor {
    timers: Option<Timers>,
    silence_timeout: Duration,
    state: LivenessState,
    traffic_since_tick: bool,
}

impl LivenessMonitor {
    /// Creates a monitor and starts both timers.
    ///
    /// The first keepalive is due one full interval after construction.
    #[must_use]
    pub fn new(config: &ConnectionConfig) -> Self {
        let now = Instant::now();
        let silence_timeout = config.silence_timeout();

        let mut keepalive = interval_at(now + config.keepalive_interval, config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            timers: Some(Timers {
                keepalive,
                silence: Box::pin(sleep(silence_timeout)),
            }),
            silence_timeout,
            state: LivenessState::Active,
            traffic_since_tick: false,
        }
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Records inbound traffic and pushes the silence deadline out.
    pub fn observe_traffic(&mut self) {
        let Some(timers) = self.timers.as_mut() else {
            return;
        };

        timers
            .silence
            .as_mut()
            .reset(Instant::now() + self.silence_timeout);
        self.traffic_since_tick = true;
        self.state = LivenessState::Active;
    }

    /// Waits for the next action.
    ///
    /// `socket_open` is sampled when a keepalive tick fires; a tick against a
    /// socket that is not open yields [`LivenessAction::ForceClose`]. Once
    /// closed, this never completes. Cancel-safe.
    pub async fn next_action(&mut self, socket_open: bool) -> LivenessAction {
        let Some(timers) = self.timers.as_mut() else {
            return pending().await;
        };

        let action = tokio::select! {
            _ = timers.keepalive.tick() => {
                if socket_open {
                    LivenessAction::SendKeepalive
                } else {
                    LivenessAction::ForceClose
                }
            }
            () = timers.silence.as_mut() => {
                debug!(timeout_ms = millis(self.silence_timeout), "Peer silent past timeout");
                LivenessAction::ForceClose
            }
        };

        match action {
            LivenessAction::SendKeepalive => {
                if !self.traffic_since_tick {
                    self.state = LivenessState::Silent;
                }
                self.traffic_since_tick = false;
                trace!(state = ?self.state, "Keepalive due");
            }
            LivenessAction::ForceClose => self.stop(),
        }

        action
    }

    /// Cancels both timers.
    pub fn stop(&mut self) {
        if self.timers.take().is_some() {
            trace!("Liveness timers cancelled");
        }
        self.state = LivenessState::Closed;
    }
}

// ============================================================================
// Tests
// ============================================================================
