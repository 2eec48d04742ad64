//! Serial link shared by the sensor node and the gateway: line framing,
//! command/ack vocabulary, reading frames, and the transports that carry
//! them.

pub mod clock;
pub mod port;
pub mod protocol;
pub mod reader;

pub use clock::{Clock, ManualClock, SystemClock};
#[cfg(feature = "serial")]
pub use port::SerialLink;
pub use port::{LinkPort, MemoryLink, TcpLink, LINK_BAUD};
pub use protocol::{
    extract_json_span, parse_frame, Ack, Command, FrameError, LinkMessage, SensorFrame,
    SOIL_RAW_MAX,
};
pub use reader::{LineReader, Outbox, DEFAULT_READ_WINDOW};
