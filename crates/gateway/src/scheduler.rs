//! Pump scheduler: turns remote control messages into link commands and
//! owns the irrigation countdown.
//!
//! The sensor node has no notion of duration; it keeps the relay wherever it
//! was last told to. The OFF that ends a run therefore always comes from
//! here, either from an explicit control message or from the auto-off check
//! in [`IrrigationScheduler::tick`], which does not depend on the broker
//! delivering anything.
//!
//! ```text
//! Off ──[ON, duration > 0]──▶ Running ──[OFF msg | elapsed >= duration]──▶ Off
//!              ▲                 │
//!              └──[ON ignored]───┘
//! ```

use irrigation_link::{Ack, Command, Outbox};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::mqtt::{ControlMessage, PumpSwitch};

const MS_PER_HOUR: f64 = 3_600_000.0;

/// How long to wait for `ACK_PUMP …` before noting that none came.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest run accepted from a control message (one week).
const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// What the gateway believes the relay should be doing. Never persisted, so
/// a restart always comes back with the pump off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct PumpState {
    pub(crate) running: bool,
    pub(crate) started_at: Option<Instant>,
    pub(crate) duration: Duration,
}

/// Result of handling one control message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ControlOutcome {
    Started { duration: Duration },
    Stopped,
    AlreadyRunning,
    AlreadyOff,
    Rejected(String),
}

pub(crate) struct IrrigationScheduler {
    pump: PumpState,
    awaiting_ack: Option<(Command, Instant)>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

impl IrrigationScheduler {
    pub(crate) fn new() -> Self {
        Self {
            pump: PumpState::default(),
            awaiting_ack: None,
        }
    }

    pub(crate) fn pump(&self) -> &PumpState {
        &self.pump
    }

    /// Time left on the current run, if one is active.
    pub(crate) fn remaining(&self, now: Instant) -> Option<Duration> {
        let started = self.pump.started_at.filter(|_| self.pump.running)?;
        Some(
            self.pump
                .duration
                .saturating_sub(now.saturating_duration_since(started)),
        )
    }

    pub(crate) fn handle_control(
        &mut self,
        msg: &ControlMessage,
        now: Instant,
        outbox: &mut Outbox,
    ) -> ControlOutcome {
        match msg.pump {
            PumpSwitch::On => self.handle_on(msg.duration_hours, now, outbox),
            PumpSwitch::Off => self.handle_off(now, outbox),
        }
    }

    fn handle_on(
        &mut self,
        hours: Option<f64>,
        now: Instant,
        outbox: &mut Outbox,
    ) -> ControlOutcome {
        let duration = match hours_to_duration(hours) {
            Ok(d) => d,
            Err(reason) => {
                warn!(?hours, "ignoring pump ON: {reason}");
                return ControlOutcome::Rejected(reason);
            }
        };

        if self.pump.running {
            info!(
                remaining_s = self.remaining(now).map(|d| d.as_secs()),
                "pump already running, ignoring new ON"
            );
            return ControlOutcome::AlreadyRunning;
        }

        self.send(Command::PumpOn, now, outbox);
        self.pump = PumpState {
            running: true,
            started_at: Some(now),
            duration,
        };
        info!(duration_s = duration.as_secs_f64(), "pump ON");
        ControlOutcome::Started { duration }
    }

    fn handle_off(&mut self, now: Instant, outbox: &mut Outbox) -> ControlOutcome {
        if !self.pump.running {
            debug!("pump OFF requested but pump is not running");
            return ControlOutcome::AlreadyOff;
        }
        self.stop(now, outbox);
        info!("pump OFF (remote)");
        ControlOutcome::Stopped
    }

    /// Once per main-loop iteration. Ends the run when its duration is up
    /// and notes acks that never arrived. Returns whether auto-off fired.
    pub(crate) fn tick(&mut self, now: Instant, outbox: &mut Outbox) -> bool {
        if let Some((cmd, sent_at)) = self.awaiting_ack {
            if now.saturating_duration_since(sent_at) >= ACK_TIMEOUT {
                warn!(command = %cmd, "no acknowledgment from sensor node");
                self.awaiting_ack = None;
            }
        }

        if !self.pump.running || self.remaining(now) != Some(Duration::ZERO) {
            return false;
        }

        self.stop(now, outbox);
        info!(
            duration_s = self.pump.duration.as_secs_f64(),
            "pump OFF (duration elapsed)"
        );
        true
    }

    /// Match a pump acknowledgment against the last command sent.
    pub(crate) fn on_ack(&mut self, ack: Ack) {
        match self.awaiting_ack {
            Some((sent, _)) if ack.acknowledges(sent) => {
                debug!(command = %sent, "sensor node acknowledged");
                self.awaiting_ack = None;
            }
            _ => debug!(%ack, "acknowledgment with nothing outstanding"),
        }
    }

    fn stop(&mut self, now: Instant, outbox: &mut Outbox) {
        self.send(Command::PumpOff, now, outbox);
        self.pump.running = false;
    }

    fn send(&mut self, cmd: Command, now: Instant, outbox: &mut Outbox) {
        outbox.command(cmd);
        self.awaiting_ack = Some((cmd, now));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Convert the control message's hours into a run length, rounded to the
/// millisecond. Any positive duration starts a run: anything shorter than a
/// millisecond runs for one, anything longer than [`MAX_DURATION`] is cut
/// down to it.
fn hours_to_duration(hours: Option<f64>) -> Result<Duration, String> {
    let hours = hours.ok_or_else(|| "duration is required with ON".to_string())?;
    if !hours.is_finite() || hours <= 0.0 {
        return Err(format!("duration must be a positive number of hours, got {hours}"));
    }
    let ms = (hours * MS_PER_HOUR).round().max(1.0);
    if ms > MAX_DURATION.as_millis() as f64 {
        warn!(
            hours,
            max_h = MAX_DURATION.as_secs() / 3600,
            "pump duration clamped to the maximum"
        );
        return Ok(MAX_DURATION);
    }
    Ok(Duration::from_millis(ms as u64))
}

// ===========================================================================
// Tests
// ===========================================================================
