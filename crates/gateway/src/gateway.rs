//! The gateway control loop. One [`Gateway::iterate`] call is one tick:
//! broker, control messages, handshake, link, auto-off, then a single
//! flush of everything queued for the sensor node.

use irrigation_link::{Clock, LineReader, LinkMessage, LinkPort, Outbox};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::handshake::{HandshakeManager, HandshakeState};
use crate::mqtt::{parse_control, Broker};
use crate::scheduler::{IrrigationScheduler, PumpState};
use crate::telemetry::TelemetryRelay;
use crate::watchdog::Watchdog;

/// Most link lines handled in one tick, so a chatty node cannot starve the
/// rest of the loop.
const MAX_LINES_PER_TICK: usize = 32;

/// Counters for the periodic status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TickStats {
    pub(crate) control_messages: usize,
    pub(crate) lines: usize,
    pub(crate) readings: usize,
    pub(crate) auto_off: bool,
    pub(crate) lines_sent: usize,
}

pub(crate) struct Gateway<P, B, C> {
    port: P,
    broker: B,
    clock: C,
    watchdog: Watchdog,
    reader: LineReader,
    outbox: Outbox,
    handshake: HandshakeManager,
    scheduler: IrrigationScheduler,
    telemetry: TelemetryRelay,
    service_budget: Duration,
    read_window: Duration,
}

impl<P: LinkPort, B: Broker, C: Clock> Gateway<P, B, C> {
    pub(crate) fn new(config: &Config, port: P, broker: B, clock: C, watchdog: Watchdog) -> Self {
        Self {
            port,
            broker,
            clock,
            watchdog,
            reader: LineReader::new(config.read_window()),
            outbox: Outbox::new(),
            handshake: HandshakeManager::new(config.retry_interval(), config.handshake.max_attempts),
            scheduler: IrrigationScheduler::new(),
            telemetry: TelemetryRelay::new(
                config.mqtt.telemetry_topic.clone(),
                config.gateway.device_id.clone(),
            ),
            service_budget: config.service_budget(),
            read_window: config.read_window(),
        }
    }

    pub(crate) fn handshake(&self) -> &HandshakeState {
        self.handshake.state()
    }

    pub(crate) fn pump(&self) -> &PumpState {
        self.scheduler.pump()
    }

    pub(crate) fn telemetry(&self) -> &TelemetryRelay {
        &self.telemetry
    }

    pub(crate) fn broker(&self) -> &B {
        &self.broker
    }

    /// Send the first `START_READING`.
    pub(crate) fn boot(&mut self) {
        self.handshake.begin(self.clock.now(), &mut self.outbox);
        self.flush();
        self.watchdog.feed();
    }

    pub(crate) async fn iterate(&mut self) -> TickStats {
        let mut stats = TickStats::default();
        self.watchdog.feed();

        // ── Broker ──────────────────────────────────────────
        let inbound = self.broker.service(self.service_budget).await;
        self.watchdog.feed();

        for msg in inbound {
            stats.control_messages += 1;
            match parse_control(&msg.payload) {
                Ok(control) => {
                    let outcome = self
                        .scheduler
                        .handle_control(&control, self.clock.now(), &mut self.outbox);
                    debug!(topic = %msg.topic, ?outcome, "control message handled");
                }
                Err(e) => warn!(topic = %msg.topic, "{e}"),
            }
        }

        // ── Handshake ───────────────────────────────────────
        self.handshake.tick(self.clock.now(), &mut self.outbox);

        // ── Link ────────────────────────────────────────────
        // No new read starts once a read window has passed, so the drain
        // lasts at most two windows however noisy the link is.
        let drain_started = self.clock.now();
        while stats.lines < MAX_LINES_PER_TICK
            && self.clock.now().saturating_duration_since(drain_started) < self.read_window
        {
            match self.reader.read_line(&mut self.port, &self.clock) {
                Ok(Some(line)) => {
                    stats.lines += 1;
                    if self.handle_line(&line) {
                        stats.readings += 1;
                    }
                    self.watchdog.feed();
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("link read failed: {e}");
                    break;
                }
            }
        }

        // ── Auto-off ────────────────────────────────────────
        stats.auto_off = self.scheduler.tick(self.clock.now(), &mut self.outbox);

        stats.lines_sent = self.flush();
        self.watchdog.feed();
        stats
    }

    /// Dispatch one line from the sensor node. Returns whether it was a
    /// reading.
    fn handle_line(&mut self, line: &str) -> bool {
        match LinkMessage::parse(line) {
            LinkMessage::Ack(ack) => {
                debug!(%ack, "ack from sensor node");
                if ack.command() == irrigation_link::Command::StartReading {
                    self.handshake.on_ack();
                } else {
                    self.scheduler.on_ack(ack);
                }
                false
            }
            LinkMessage::Reading(frame) => {
                self.handshake.on_reading();
                self.telemetry.relay(&frame, &mut self.broker);
                true
            }
            LinkMessage::Garbled(e) => {
                warn!(line, "dropping link frame: {e}");
                false
            }
            LinkMessage::Diagnostic(text) => {
                debug!(%text, "sensor node");
                false
            }
        }
    }

    fn flush(&mut self) -> usize {
        match self.outbox.flush(&mut self.port) {
            Ok(n) => n,
            Err(e) => {
                warn!("link write failed, commands dropped: {e}");
                0
            }
        }
    }

    /// Log one status line.
    pub(crate) fn report(&self) {
        let now = self.clock.now();
        let handshake = self.handshake();
        info!(
            handshake = ?self.handshake.phase(),
            started = handshake.started(),
            attempts = handshake.attempts,
            pump = self.pump().running,
            remaining_s = self.scheduler.remaining(now).map(|d| d.as_secs()),
            link_open = !self.reader.is_closed(),
            mqtt = self.broker().is_connected(),
            published = self.telemetry().published(),
            dropped = self.telemetry().dropped(),
            "status"
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================
