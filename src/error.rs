//! Error types for the acquisition core.
//!
//! Only trace loading surfaces errors to the caller. Transport faults are
//! recovered by reconnecting, and malformed frames are counted in
//! [`DecodeStats`] rather than reported one by one.

use std::fmt;
use std::io;

/// Errors opening or talking to the serial device.
#[derive(Debug)]
pub enum ConnectionError {
    /// No port name was given and none could be found.
    NoPort,
    /// The port exists but could not be opened.
    Open { port: String, reason: String },
    /// A read or write failed on an open port.
    Io(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::NoPort => write!(f, "No serial port available"),
            ConnectionError::Open { port, reason } => {
                write!(f, "Failed to open serial port {}: {}", port, reason)
            }
            ConnectionError::Io(msg) => write!(f, "Serial I/O error: {}", msg),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors loading a trace for playback.
#[derive(Debug)]
pub enum FormatError {
    /// File shorter than the header plus one record.
    Truncated { len: usize },
    /// Body length is not a whole number of records.
    MisalignedBody { body_len: usize },
    /// Header is present but no records follow.
    Empty,
    /// A header field holds an impossible value.
    BadHeader(String),
    /// A text trace sample line does not hold a time and six values.
    BadLine { line: usize, reason: String },
    /// The file could not be read.
    Io(String),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::Truncated { len } => {
                write!(f, "Trace truncated: {} bytes is less than header plus one record", len)
            }
            FormatError::MisalignedBody { body_len } => {
                write!(f, "Trace body of {} bytes is not a multiple of the record size", body_len)
            }
            FormatError::Empty => write!(f, "Trace contains no samples"),
            FormatError::BadHeader(msg) => write!(f, "Malformed trace header: {}", msg),
            FormatError::BadLine { line, reason } => {
                write!(f, "Malformed trace line {}: {}", line, reason)
            }
            FormatError::Io(msg) => write!(f, "Failed to read trace: {}", msg),
        }
    }
}

impl std::error::Error for FormatError {}

impl From<io::Error> for FormatError {
    fn from(e: io::Error) -> Self {
        FormatError::Io(e.to_string())
    }
}

/// Running counters kept by the frame decoder. Sync faults never propagate;
/// they only show up here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Frames successfully decoded.
    pub frames: u64,
    /// Burst markers consumed.
    pub markers: u64,
    /// Bursts whose length was not a whole number of frames.
    pub sync_errors: u64,
    /// Bytes discarded (partial frames, overflowed carry-over, resync skips).
    pub dropped_bytes: u64,
}
