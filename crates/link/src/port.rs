//! Byte transports for the link. The serial port is the production path; the
//! TCP bridge lets both binaries run on a development machine, and the
//! in-memory pair backs the tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Baud rate both nodes use on the UART.
pub const LINK_BAUD: u32 = 9600;

/// A point-to-point byte channel polled without blocking.
pub trait LinkPort {
    /// Copy whatever bytes are already pending into `buf`. Returns `Ok(0)`
    /// immediately when nothing is pending.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `bytes` to the peer.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<P: LinkPort + ?Sized> LinkPort for Box<P> {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_available(buf)
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).send(bytes)
    }
}

// ---------------------------------------------------------------------------
// In-memory pair
// ---------------------------------------------------------------------------

type Pipe = Rc<RefCell<VecDeque<u8>>>;

/// One end of an in-process link. Bytes sent on one end become readable on
/// the other.
#[derive(Debug)]
pub struct MemoryLink {
    rx: Pipe,
    tx: Pipe,
}

impl MemoryLink {
    pub fn pair() -> (Self, Self) {
        let a: Pipe = Rc::default();
        let b: Pipe = Rc::default();
        (
            Self {
                rx: Rc::clone(&a),
                tx: Rc::clone(&b),
            },
            Self { rx: b, tx: a },
        )
    }

    /// Everything pending on this end, as text.
    pub fn drain_text(&mut self) -> String {
        let bytes: Vec<u8> = self.rx.borrow_mut().drain(..).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl LinkPort for MemoryLink {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.borrow_mut();
        let n = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.tx.borrow_mut().extend(bytes);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TCP bridge (development)
// ---------------------------------------------------------------------------

/// Upper bound on how long a single `send` may spin on a full socket buffer.
const TCP_SEND_DEADLINE: Duration = Duration::from_secs(1);

/// Link carried over a non-blocking TCP stream, for running the gateway
/// against a sensor node on the same machine.
#[derive(Debug)]
pub struct TcpLink {
    stream: TcpStream,
}

impl TcpLink {
    /// Connect to a sensor node listening on `addr`.
    pub fn connect(addr: &str, timeout: Duration) -> io::Result<Self> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}"));
        for sock in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock, timeout) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Block until a gateway connects to `listener`.
    pub fn accept(listener: &TcpListener) -> io::Result<Self> {
        let (stream, peer) = listener.accept()?;
        tracing::info!(%peer, "link peer connected");
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl LinkPort for TcpLink {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "link peer closed the connection",
            )),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + TCP_SEND_DEADLINE;
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Serial UART (production)
// ---------------------------------------------------------------------------

#[cfg(feature = "serial")]
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial")]
impl SerialLink {
    /// Open `device` at `baud`, 8N1, no flow control.
    pub fn open(device: &str, baud: u32) -> io::Result<Self> {
        let port = serialport::new(device, baud)
            .timeout(Duration::from_millis(10))
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        // Discard anything that piled up before we were listening.
        port.clear(serialport::ClearBuffer::All)?;
        tracing::info!(device, baud, "serial link opened");
        Ok(Self { port })
    }
}

#[cfg(feature = "serial")]
impl LinkPort for SerialLink {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pending = self.port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let n = pending.min(buf.len());
        match self.port.read(&mut buf[..n]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
