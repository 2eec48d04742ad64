//! Bounded-retry `START_READING` handshake with the sensor node.
//!
//! ```text
//! Idle ──begin──▶ Sent(1) ──[no reply within retry interval]──▶ Sent(n+1)
//!                   │                                               │
//!                   │                          [n == max_attempts]──▶ Exhausted
//!                   │                                               │
//!                   └──────[ack or any reading]──▶ Started ◀────────┘
//! ```
//!
//! `Started` is terminal. `Exhausted` only stops the retries: a late ack or
//! reading still moves it to `Started`.

use irrigation_link::{Command, Outbox};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub(crate) const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakePhase {
    Idle,
    Sent { attempt: u32 },
    Started,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HandshakeState {
    pub(crate) phase: HandshakePhase,
    pub(crate) attempts: u32,
    pub(crate) last_attempt_at: Option<Instant>,
}

impl HandshakeState {
    pub(crate) fn started(&self) -> bool {
        self.phase == HandshakePhase::Started
    }
}

pub(crate) struct HandshakeManager {
    state: HandshakeState,
    retry_interval: Duration,
    max_attempts: u32,
}

impl HandshakeManager {
    pub(crate) fn new(retry_interval: Duration, max_attempts: u32) -> Self {
        Self {
            state: HandshakeState {
                phase: HandshakePhase::Idle,
                attempts: 0,
                last_attempt_at: None,
            },
            retry_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub(crate) fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub(crate) fn phase(&self) -> HandshakePhase {
        self.state.phase
    }

    /// First send, at boot. Only valid from `Idle`.
    pub(crate) fn begin(&mut self, now: Instant, outbox: &mut Outbox) {
        if self.state.phase != HandshakePhase::Idle {
            return;
        }
        self.send(1, now, outbox);
        info!("sent START_READING to sensor node");
    }

    /// Resend or give up once the retry interval since the last send has
    /// passed without an answer.
    pub(crate) fn tick(&mut self, now: Instant, outbox: &mut Outbox) {
        let HandshakePhase::Sent { attempt } = self.state.phase else {
            return;
        };
        let Some(last) = self.state.last_attempt_at else {
            return;
        };
        if now.saturating_duration_since(last) < self.retry_interval {
            return;
        }

        if attempt >= self.max_attempts {
            self.state.phase = HandshakePhase::Exhausted;
            warn!(
                attempts = self.state.attempts,
                "sensor node never answered START_READING, giving up retries"
            );
            return;
        }

        let next = attempt + 1;
        self.send(next, now, outbox);
        info!(attempt = next, max = self.max_attempts, "retrying START_READING");
    }

    /// `ACK_START_READING` received.
    pub(crate) fn on_ack(&mut self) {
        self.confirm("ack");
    }

    /// A valid reading arrived, which proves the node is sampling.
    pub(crate) fn on_reading(&mut self) {
        self.confirm("reading");
    }

    fn confirm(&mut self, via: &str) {
        match self.state.phase {
            HandshakePhase::Started => {}
            HandshakePhase::Exhausted => {
                info!(via, "sensor node answered after retries were exhausted");
                self.state.phase = HandshakePhase::Started;
            }
            HandshakePhase::Idle | HandshakePhase::Sent { .. } => {
                info!(via, attempts = self.state.attempts, "sensor node sampling confirmed");
                self.state.phase = HandshakePhase::Started;
            }
        }
    }

    fn send(&mut self, attempt: u32, now: Instant, outbox: &mut Outbox) {
        outbox.command(Command::StartReading);
        self.state.attempts = attempt;
        self.state.last_attempt_at = Some(now);
        self.state.phase = HandshakePhase::Sent { attempt };
    }
}

// ===========================================================================
// Tests
// ===========================================================================
