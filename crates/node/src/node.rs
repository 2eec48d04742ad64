//! One sensor-node iteration: poll a command, tick the sampler, flush.

use irrigation_link::{Clock, Command, LinkPort, Outbox, SensorFrame};
use std::time::Duration;

use crate::dispatcher::CommandDispatcher;
use crate::relay::PumpRelay;
use crate::sensor::{SensorLoop, SensorSource};

pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_millis(50);

/// What happened during one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeTick {
    pub command: Option<Command>,
    pub frame: Option<SensorFrame>,
    pub lines_sent: usize,
}

pub struct SensorNode<P, C, R, S> {
    port: P,
    clock: C,
    relay: R,
    sensors: S,
    dispatcher: CommandDispatcher,
    sampler: SensorLoop,
    outbox: Outbox,
}

impl<P: LinkPort, C: Clock, R: PumpRelay, S: SensorSource> SensorNode<P, C, R, S> {
    pub fn new(
        port: P,
        clock: C,
        relay: R,
        sensors: S,
        sample_interval: Duration,
        read_window: Duration,
    ) -> Self {
        Self {
            port,
            clock,
            relay,
            sensors,
            dispatcher: CommandDispatcher::new(read_window),
            sampler: SensorLoop::new(sample_interval),
            outbox: Outbox::new(),
        }
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn sampler(&self) -> &SensorLoop {
        &self.sampler
    }

    pub fn link_closed(&self) -> bool {
        self.dispatcher.link_closed()
    }

    /// Make sure the pump starts off, whatever the relay driver did.
    pub fn boot(&mut self) {
        self.relay.set(false);
        self.sensors.pump_changed(false);
    }

    pub fn iterate(&mut self) -> NodeTick {
        let command = self.dispatcher.poll(
            &mut self.port,
            &self.clock,
            &mut self.relay,
            &mut self.sensors,
            &mut self.sampler,
            &mut self.outbox,
        );
        let frame = self
            .sampler
            .tick(self.clock.now(), &mut self.sensors, &mut self.outbox);

        let lines_sent = match self.outbox.flush(&mut self.port) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("link write failed: {e}");
                0
            }
        };

        NodeTick {
            command,
            frame,
            lines_sent,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MockRelay;
    use crate::sensor::tests::FixedSensors;
    use crate::sensor::DEFAULT_SAMPLE_INTERVAL;
    use irrigation_link::{parse_frame, ManualClock, MemoryLink, DEFAULT_READ_WINDOW};

    type TestNode = SensorNode<MemoryLink, ManualClock, MockRelay, FixedSensors>;

    fn node() -> (TestNode, MemoryLink, ManualClock) {
        let (gateway, port) = MemoryLink::pair();
        let clock = ManualClock::new();
        let mut node = SensorNode::new(
            port,
            clock.clone(),
            MockRelay::new(true).unwrap(),
            FixedSensors::default(),
            DEFAULT_SAMPLE_INTERVAL,
            DEFAULT_READ_WINDOW,
        );
        node.boot();
        (node, gateway, clock)
    }

    fn lines(link: &mut MemoryLink) -> Vec<String> {
        link.drain_text().lines().map(str::to_string).collect()
    }

    #[test]
    fn silent_until_started() {
        let (mut node, mut gateway, clock) = node();
        for _ in 0..200 {
            clock.advance(DEFAULT_LOOP_INTERVAL);
            node.iterate();
        }
        assert!(lines(&mut gateway).is_empty());
    }

    #[test]
    fn start_reading_acks_then_samples_in_same_flush() {
        let (mut node, mut gateway, _clock) = node();
        gateway.send(b"START_READING\n").unwrap();

        let tick = node.iterate();
        assert_eq!(tick.command, Some(Command::StartReading));
        assert!(tick.frame.is_some());

        let sent = lines(&mut gateway);
        assert_eq!(sent[0], "Received command: START_READING");
        assert_eq!(sent[1], "ACK_START_READING");
        assert_eq!(parse_frame(&sent[2]).unwrap(), tick.frame.unwrap());
        assert_eq!(sent.len(), 5);
        assert_eq!(tick.lines_sent, 5);
    }

    #[test]
    fn sampling_cadence_ignores_command_traffic() {
        let (mut node, mut gateway, clock) = node();
        gateway.send(b"START_READING\n").unwrap();

        // 30 s of iterations with a pump command every second.
        let mut frames = 0;
        for i in 0..600 {
            if i % 20 == 0 {
                let cmd: &[u8] = if i % 40 == 0 { b"PUMP ON\n" } else { b"PUMP OFF\n" };
                gateway.send(cmd).unwrap();
            }
            if node.iterate().frame.is_some() {
                frames += 1;
            }
            clock.advance(DEFAULT_LOOP_INTERVAL);
        }
        // t = 0, 6, 12, 18, 24
        assert_eq!(frames, 5);
    }

    #[test]
    fn pump_follows_commands() {
        let (mut node, mut gateway, _clock) = node();

        gateway.send(b"PUMP ON\n").unwrap();
        node.iterate();
        assert!(node.relay().is_on());

        gateway.send(b"PUMP OFF\n").unwrap();
        node.iterate();
        assert!(!node.relay().is_on());

        let sent = lines(&mut gateway);
        assert!(sent.contains(&"ACK_PUMP ON".to_string()));
        assert!(sent.contains(&"ACK_PUMP OFF".to_string()));
    }

    #[test]
    fn node_never_times_out_the_pump() {
        let (mut node, mut gateway, clock) = node();
        gateway.send(b"PUMP ON\n").unwrap();
        node.iterate();

        clock.advance(Duration::from_secs(24 * 3600));
        node.iterate();
        assert!(node.relay().is_on());
    }
}
