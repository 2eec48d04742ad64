//! Wire format shared by the sensor node and the gateway.
//!
//! Commands and acknowledgments are single plaintext lines. Readings travel
//! as one JSON object per line, possibly surrounded by diagnostic chatter
//! from the sensor node, so the gateway side extracts the outermost `{ … }`
//! span before decoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest raw value the sensor node's 10-bit ADC can report.
pub const SOIL_RAW_MAX: u16 = 1023;

const ACK_PREFIX: &str = "ACK_";

// ---------------------------------------------------------------------------
// Commands and acknowledgments
// ---------------------------------------------------------------------------

/// A command sent from the gateway to the sensor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    StartReading,
    PumpOn,
    PumpOff,
}

impl Command {
    /// Exact line text on the wire (without the trailing newline).
    pub const fn as_line(self) -> &'static str {
        match self {
            Self::StartReading => "START_READING",
            Self::PumpOn => "PUMP ON",
            Self::PumpOff => "PUMP OFF",
        }
    }

    /// Acknowledgment line the sensor node answers this command with.
    pub const fn ack_line(self) -> &'static str {
        match self {
            Self::StartReading => "ACK_START_READING",
            Self::PumpOn => "ACK_PUMP ON",
            Self::PumpOff => "ACK_PUMP OFF",
        }
    }

    /// Parse a command line. Surrounding whitespace is ignored, the text
    /// itself must match exactly.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "START_READING" => Some(Self::StartReading),
            "PUMP ON" => Some(Self::PumpOn),
            "PUMP OFF" => Some(Self::PumpOff),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_line())
    }
}

/// Acknowledgment of a [`Command`]. There are no sequence numbers on the
/// link, so an ack is matched to what was sent purely by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack(pub Command);

impl Ack {
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix(ACK_PREFIX)?;
        Command::parse(rest).map(Ack)
    }

    pub const fn command(self) -> Command {
        self.0
    }

    pub fn acknowledges(self, sent: Command) -> bool {
        self.0 == sent
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.ack_line())
    }
}

// ---------------------------------------------------------------------------
// Sensor frames
// ---------------------------------------------------------------------------

/// One sample of the sensor node's instruments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorFrame {
    #[serde(rename = "TEMP")]
    pub temperature: f32,
    #[serde(rename = "HUM")]
    pub humidity: f32,
    #[serde(rename = "SOIL")]
    pub soil_raw: u16,
    #[serde(rename = "SOIL_PERCENT")]
    pub soil_percent: u8,
}

impl SensorFrame {
    /// Single-line JSON encoding, without the trailing newline.
    pub fn to_line(&self) -> String {
        // Only fails on non-string map keys, which this struct does not have.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Why a line that looked like a reading could not be turned into one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// No `{` … `}` span (missing brace, or `}` before `{`).
    NoJson,
    /// The span was found but is not a valid frame object.
    Malformed(String),
    /// Decoded fine, but a value is outside what the sensor can produce.
    OutOfRange { soil_raw: u16, soil_percent: u8 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoJson => write!(f, "no JSON object in line"),
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::OutOfRange {
                soil_raw,
                soil_percent,
            } => write!(
                f,
                "frame out of range: SOIL={soil_raw} SOIL_PERCENT={soil_percent}"
            ),
        }
    }
}

impl std::error::Error for FrameError {}

/// Locate the first `{` and the last `}` in `text` and return that span,
/// braces included.
pub fn extract_json_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Decode a reading from a (possibly noisy) chunk of link text.
pub fn parse_frame(text: &str) -> Result<SensorFrame, FrameError> {
    let span = extract_json_span(text).ok_or(FrameError::NoJson)?;
    let frame: SensorFrame =
        serde_json::from_str(span).map_err(|e| FrameError::Malformed(e.to_string()))?;

    if frame.soil_raw > SOIL_RAW_MAX || frame.soil_percent > 100 {
        return Err(FrameError::OutOfRange {
            soil_raw: frame.soil_raw,
            soil_percent: frame.soil_percent,
        });
    }
    Ok(frame)
}

// ---------------------------------------------------------------------------
// Gateway-bound lines
// ---------------------------------------------------------------------------

/// Everything the gateway can receive from the sensor node, one line at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkMessage {
    Ack(Ack),
    Reading(SensorFrame),
    /// Contained a brace but did not decode; dropped by the caller.
    Garbled(FrameError),
    /// Free-form text (echoes, fault notices, raw values).
    Diagnostic(String),
}

impl LinkMessage {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if let Some(ack) = Ack::parse(line) {
            return Self::Ack(ack);
        }
        if line.contains('{') {
            return match parse_frame(line) {
                Ok(frame) => Self::Reading(frame),
                Err(e) => Self::Garbled(e),
            };
        }
        Self::Diagnostic(line.to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
