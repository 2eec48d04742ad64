//! Line framing over a boundary-less byte stream, and the single-writer
//! outbox each node flushes once per loop iteration.

use std::io;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::port::LinkPort;
use crate::protocol::Command;

/// How long a partial line may keep accumulating, measured from its first
/// byte, before it is handed over as-is.
pub const DEFAULT_READ_WINDOW: Duration = Duration::from_millis(1000);

/// A line longer than this without a newline is flushed regardless.
pub const MAX_LINE_LEN: usize = 512;

/// Gap between polls while a partial line is pending.
const POLL_GAP: Duration = Duration::from_millis(1);

const CHUNK: usize = 64;

// ---------------------------------------------------------------------------
// LineReader
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LineReader {
    buf: Vec<u8>,
    first_byte_at: Option<Instant>,
    window: Duration,
    closed: bool,
}

impl LineReader {
    pub fn new(window: Duration) -> Self {
        Self {
            buf: Vec::with_capacity(MAX_LINE_LEN),
            first_byte_at: None,
            window,
            closed: false,
        }
    }

    /// Bytes received but not yet returned as a line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// The peer hung up. The port is not polled again.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Return the next line from `port`, without its terminator.
    ///
    /// Returns `Ok(None)` straight away when nothing is pending. Once a byte
    /// has arrived, keeps polling until a newline shows up or the read window
    /// (counted from that first byte) runs out, in which case the partial
    /// text is returned as a line of its own. The window holds even while
    /// bytes keep streaming in, so one call never outlasts it. Blank lines
    /// are skipped.
    pub fn read_line<P, C>(&mut self, port: &mut P, clock: &C) -> io::Result<Option<String>>
    where
        P: LinkPort + ?Sized,
        C: Clock + ?Sized,
    {
        let mut chunk = [0u8; CHUNK];
        loop {
            while let Some(line) = self.take_line(clock.now()) {
                if !line.is_empty() {
                    return Ok(Some(line));
                }
            }

            if let Some(started) = self.first_byte_at {
                if clock.now().saturating_duration_since(started) >= self.window {
                    tracing::debug!(len = self.buf.len(), "link read window elapsed on partial line");
                    return Ok(self.flush());
                }
            }
            if self.closed {
                return Ok(self.flush());
            }

            let n = match port.read_available(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!("link closed by peer: {e}");
                    self.closed = true;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if n > 0 {
                if self.first_byte_at.is_none() {
                    self.first_byte_at = Some(clock.now());
                }
                self.buf.extend_from_slice(&chunk[..n]);
                if self.buf.len() >= MAX_LINE_LEN && !self.buf.contains(&b'\n') {
                    tracing::warn!(len = self.buf.len(), "link line too long, flushing");
                    if let Some(line) = self.flush() {
                        return Ok(Some(line));
                    }
                }
                continue;
            }

            if self.first_byte_at.is_none() {
                return Ok(None);
            }
            clock.delay(POLL_GAP);
        }
    }

    /// Split off the first complete line, if any. A leftover partial line
    /// gets its window restarted at `now`.
    fn take_line(&mut self, now: Instant) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.buf.drain(..=pos).collect();
        self.first_byte_at = if self.buf.is_empty() { None } else { Some(now) };
        Some(decode(&raw))
    }

    fn flush(&mut self) -> Option<String> {
        self.first_byte_at = None;
        let raw = std::mem::take(&mut self.buf);
        let line = decode(&raw);
        (!line.is_empty()).then_some(line)
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new(DEFAULT_READ_WINDOW)
    }
}

fn decode(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Lines queued during one loop iteration. Flushing writes them to the port
/// in a single call, so two producers in the same tick can never interleave
/// on the wire.
#[derive(Debug, Default)]
pub struct Outbox {
    lines: Vec<String>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn command(&mut self, cmd: Command) {
        self.push(cmd.as_line());
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Write every queued line, newline-terminated. Returns how many lines
    /// went out. On error the queue is still cleared: link writes are
    /// at-most-once.
    pub fn flush<P: LinkPort + ?Sized>(&mut self, port: &mut P) -> io::Result<usize> {
        if self.lines.is_empty() {
            return Ok(0);
        }
        let count = self.lines.len();
        let mut wire = String::new();
        for line in self.lines.drain(..) {
            wire.push_str(&line);
            wire.push('\n');
        }
        port.send(wire.as_bytes())?;
        Ok(count)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::port::MemoryLink;

    /// Port that hands out pre-scripted chunks, one per read, advancing the
    /// clock before each.
    struct Scripted {
        chunks: Vec<(Duration, &'static [u8])>,
        clock: ManualClock,
    }

    impl LinkPort for Scripted {
        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let (wait, bytes) = self.chunks.remove(0);
            self.clock.advance(wait);
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok(bytes.len())
        }

        fn send(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    // -- LineReader ----------------------------------------------------------

    #[test]
    fn idle_port_returns_none_without_waiting() {
        let clock = ManualClock::new();
        let (mut port, _peer) = MemoryLink::pair();
        let mut reader = LineReader::default();

        assert_eq!(reader.read_line(&mut port, &clock).unwrap(), None);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn reads_lines_one_at_a_time() {
        let clock = ManualClock::new();
        let (mut port, mut peer) = MemoryLink::pair();
        peer.send(b"ACK_START_READING\r\n512\n").unwrap();

        let mut reader = LineReader::default();
        assert_eq!(
            reader.read_line(&mut port, &clock).unwrap().as_deref(),
            Some("ACK_START_READING")
        );
        assert_eq!(reader.read_line(&mut port, &clock).unwrap().as_deref(), Some("512"));
        assert_eq!(reader.read_line(&mut port, &clock).unwrap(), None);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let clock = ManualClock::new();
        let (mut port, mut peer) = MemoryLink::pair();
        peer.send(b"\n\r\n  \nPUMP OFF\n").unwrap();

        let mut reader = LineReader::default();
        assert_eq!(
            reader.read_line(&mut port, &clock).unwrap().as_deref(),
            Some("PUMP OFF")
        );
    }

    #[test]
    fn fragmented_line_is_reassembled() {
        let clock = ManualClock::new();
        let mut port = Scripted {
            chunks: vec![
                (Duration::ZERO, &b"{\"TEMP\":22.5,\"HUM\""[..]),
                (Duration::from_millis(200), &b":55.0,\"SOIL\":400,"[..]),
                (Duration::from_millis(200), &b"\"SOIL_PERCENT\":61}\n"[..]),
            ],
            clock: clock.clone(),
        };

        let mut reader = LineReader::default();
        let line = reader.read_line(&mut port, &clock).unwrap().unwrap();
        assert_eq!(line, r#"{"TEMP":22.5,"HUM":55.0,"SOIL":400,"SOIL_PERCENT":61}"#);
    }

    #[test]
    fn partial_line_flushed_after_window_from_first_byte() {
        let clock = ManualClock::new();
        let (mut port, mut peer) = MemoryLink::pair();
        peer.send(b"{garbage").unwrap();

        let mut reader = LineReader::new(Duration::from_millis(300));
        let line = reader.read_line(&mut port, &clock).unwrap();

        assert_eq!(line.as_deref(), Some("{garbage"));
        assert!(clock.elapsed() >= Duration::from_millis(300));
        assert!(clock.elapsed() < Duration::from_millis(310));
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn window_counts_from_first_byte_not_call_start() {
        let clock = ManualClock::new();
        // First byte arrives 900ms into the call; the window must run a full
        // second from there.
        let mut port = Scripted {
            chunks: vec![(Duration::from_millis(900), &b"PUMP"[..])],
            clock: clock.clone(),
        };

        let mut reader = LineReader::new(Duration::from_millis(1000));
        let line = reader.read_line(&mut port, &clock).unwrap();

        assert_eq!(line.as_deref(), Some("PUMP"));
        assert!(clock.elapsed() >= Duration::from_millis(1900));
    }

    #[test]
    fn overlong_line_is_flushed() {
        let clock = ManualClock::new();
        let (mut port, mut peer) = MemoryLink::pair();
        peer.send(&[b'x'; MAX_LINE_LEN + 10]).unwrap();

        let mut reader = LineReader::default();
        let line = reader.read_line(&mut port, &clock).unwrap().unwrap();
        assert!(line.len() >= MAX_LINE_LEN);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    /// Port that never goes quiet: one byte per read, 5ms apart.
    struct Chatter {
        clock: ManualClock,
    }

    impl LinkPort for Chatter {
        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.clock.advance(Duration::from_millis(5));
            buf[0] = b'x';
            Ok(1)
        }

        fn send(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn streaming_bytes_cannot_outlast_the_window() {
        let clock = ManualClock::new();
        let mut port = Chatter {
            clock: clock.clone(),
        };

        let mut reader = LineReader::new(Duration::from_millis(1000));
        let line = reader.read_line(&mut port, &clock).unwrap().unwrap();

        // 200 bytes in one second, well short of the length cap.
        assert!(line.len() < MAX_LINE_LEN, "flushed by length, not window: {}", line.len());
        assert!(clock.elapsed() <= Duration::from_millis(1010), "took {:?}", clock.elapsed());
    }

    // -- Peer closed ---------------------------------------------------------

    struct Hangup {
        reads: usize,
    }

    impl LinkPort for Hangup {
        fn read_available(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"))
        }

        fn send(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn closed_peer_is_noted_once_then_left_alone() {
        let clock = ManualClock::new();
        let mut port = Hangup { reads: 0 };
        let mut reader = LineReader::default();

        for _ in 0..10 {
            assert_eq!(reader.read_line(&mut port, &clock).unwrap(), None);
        }
        assert!(reader.is_closed());
        assert_eq!(port.reads, 1);
    }

    #[test]
    fn partial_line_survives_hangup() {
        struct LastWords {
            said: bool,
        }

        impl LinkPort for LastWords {
            fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.said {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                self.said = true;
                buf[..8].copy_from_slice(b"ACK_PUMP");
                Ok(8)
            }

            fn send(&mut self, _bytes: &[u8]) -> io::Result<()> {
                Ok(())
            }
        }

        let clock = ManualClock::new();
        let mut port = LastWords { said: false };
        let mut reader = LineReader::default();

        let line = reader.read_line(&mut port, &clock).unwrap();
        assert_eq!(line.as_deref(), Some("ACK_PUMP"));
        assert!(reader.is_closed());
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert_eq!(reader.read_line(&mut port, &clock).unwrap(), None);
    }

    // -- Outbox --------------------------------------------------------------

    #[test]
    fn outbox_flushes_in_order_with_newlines() {
        let (mut port, mut peer) = MemoryLink::pair();
        let mut outbox = Outbox::new();
        outbox.command(Command::StartReading);
        outbox.command(Command::PumpOn);

        assert_eq!(outbox.flush(&mut port).unwrap(), 2);
        assert!(outbox.is_empty());
        assert_eq!(peer.drain_text(), "START_READING\nPUMP ON\n");
    }

    #[test]
    fn outbox_empty_flush_writes_nothing() {
        let (mut port, mut peer) = MemoryLink::pair();
        assert_eq!(Outbox::new().flush(&mut port).unwrap(), 0);
        assert_eq!(peer.drain_text(), "");
    }

    #[test]
    fn outbox_cleared_on_write_error() {
        struct Broken;
        impl LinkPort for Broken {
            fn read_available(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn send(&mut self, _bytes: &[u8]) -> io::Result<()> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
        }

        let mut outbox = Outbox::new();
        outbox.command(Command::PumpOff);
        assert!(outbox.flush(&mut Broken).is_err());
        assert!(outbox.is_empty());
    }
}
