//! Gateway commands → relay and sampler. One line per poll; every line is
//! echoed back, recognised commands are executed and acknowledged.

use irrigation_link::{Clock, Command, LineReader, LinkPort, Outbox};
use std::time::Duration;

use crate::relay::PumpRelay;
use crate::sensor::{SensorLoop, SensorSource};

pub struct CommandDispatcher {
    reader: LineReader,
}

impl CommandDispatcher {
    pub fn new(read_window: Duration) -> Self {
        Self {
            reader: LineReader::new(read_window),
        }
    }

    /// The gateway hung up; nothing more will arrive on this port.
    pub fn link_closed(&self) -> bool {
        self.reader.is_closed()
    }

    /// Read at most one line from `port` and act on it. Returns the command
    /// executed, if the line was one.
    pub fn poll<P, C, R, S>(
        &mut self,
        port: &mut P,
        clock: &C,
        relay: &mut R,
        sensors: &mut S,
        sampler: &mut SensorLoop,
        outbox: &mut Outbox,
    ) -> Option<Command>
    where
        P: LinkPort + ?Sized,
        C: Clock + ?Sized,
        R: PumpRelay + ?Sized,
        S: SensorSource + ?Sized,
    {
        let line = match self.reader.read_line(port, clock) {
            Ok(Some(line)) => line,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("link read failed: {e}");
                return None;
            }
        };

        outbox.push(format!("Received command: {line}"));

        let Some(cmd) = Command::parse(&line) else {
            tracing::warn!(%line, "unknown command ignored");
            return None;
        };

        match cmd {
            Command::StartReading => sampler.enable(),
            Command::PumpOn | Command::PumpOff => {
                let on = cmd == Command::PumpOn;
                relay.set(on);
                sensors.pump_changed(on);
            }
        }
        outbox.push(cmd.ack_line());
        tracing::info!(command = %cmd, "command executed");
        Some(cmd)
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new(irrigation_link::DEFAULT_READ_WINDOW)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
