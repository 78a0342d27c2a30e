//! Module for the logical J1939 channel used by the query layer
//!
//! The query layer never manages the physical connection. It is handed something
//! implementing [BusTransport], which can
//! * Send a single frame (Usually a request for a PGN)
//! * Collect every frame arriving within a time window
//!
//! [J1939Id] handles the 29bit identifier layout shared by every J1939 frame.

use std::time::Duration;

use crate::{ack::Acknowledgment, packet::RawPacket};

/// Request PGN (59904)
pub const PGN_REQUEST: u32 = 0xEA00;
/// Acknowledgment PGN (59392)
pub const PGN_ACKNOWLEDGMENT: u32 = 0xE800;
/// Transport protocol connection management PGN (60416)
pub const PGN_TP_CM: u32 = 0xEC00;
/// Transport protocol data transfer PGN (60160)
pub const PGN_TP_DT: u32 = 0xEB00;
/// Global destination address
pub const GLOBAL_ADDRESS: u8 = 0xFF;
/// Preferred address of an off board diagnostic tool
pub const TOOL_ADDRESS: u8 = 0xF9;
/// Priority used for request messages
pub const REQUEST_PRIORITY: u8 = 6;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO Error with channel
    IOError(std::io::Error),
    /// Timeout when writing data to the channel
    WriteTimeout,
    /// The interface is not open
    InterfaceNotOpen,
    /// The bus went away while the channel was in use
    Disconnected,
    /// Unsupported channel request, such as a frame which cannot be expressed on the bus
    UnsupportedRequest,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::IOError(e) => write!(f, "IO error: {e}"),
            ChannelError::WriteTimeout => write!(f, "timeout writing to channel"),
            ChannelError::InterfaceNotOpen => write!(f, "channel's interface is not open"),
            ChannelError::Disconnected => write!(f, "channel was disconnected from the bus"),
            ChannelError::UnsupportedRequest => write!(f, "unsupported channel request"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IOError(io_err) => Some(io_err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self::IOError(e)
    }
}

/// Returns true if the PGN is in PDU1 format (PF < 240), meaning the
/// PS field of the identifier carries a destination address
pub fn is_pdu1(pgn: u32) -> bool {
    (pgn >> 8) & 0xFF < 0xF0
}

/// Decoded 29bit J1939 identifier
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct J1939Id {
    /// Message priority (0-7)
    pub priority: u8,
    /// Parameter group number. For PDU1 PGNs the PS byte is always 0
    pub pgn: u32,
    /// Destination address. Only present for PDU1 PGNs
    pub destination: Option<u8>,
    /// Source address of the sender
    pub source: u8,
}

impl J1939Id {
    /// Creates a new identifier
    pub fn new(priority: u8, pgn: u32, destination: Option<u8>, source: u8) -> Self {
        if is_pdu1(pgn) {
            Self {
                priority,
                pgn: pgn & 0x3FF00,
                destination: Some(destination.unwrap_or(GLOBAL_ADDRESS)),
                source,
            }
        } else {
            Self {
                priority,
                pgn: pgn & 0x3FFFF,
                destination: None,
                source,
            }
        }
    }

    /// Splits a raw 29bit CAN identifier
    pub fn from_raw(raw: u32) -> Self {
        let priority = ((raw >> 26) & 0x07) as u8;
        let pgn = (raw >> 8) & 0x3FFFF;
        let source = (raw & 0xFF) as u8;
        if is_pdu1(pgn) {
            Self {
                priority,
                pgn: pgn & 0x3FF00,
                destination: Some((pgn & 0xFF) as u8),
                source,
            }
        } else {
            Self {
                priority,
                pgn,
                destination: None,
                source,
            }
        }
    }

    /// Builds the raw 29bit CAN identifier
    pub fn to_raw(&self) -> u32 {
        let mut pgn = self.pgn & 0x3FFFF;
        if is_pdu1(pgn) {
            pgn = (pgn & 0x3FF00) | self.destination.unwrap_or(GLOBAL_ADDRESS) as u32;
        }
        ((self.priority as u32 & 0x07) << 26) | (pgn << 8) | self.source as u32
    }
}

/// Outgoing frame. Used for PGN requests, and by transports for
/// transport protocol flow control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// Frame identifier
    pub id: J1939Id,
    /// Frame payload (Max 8 bytes)
    pub data: Vec<u8>,
}

impl RequestFrame {
    /// Creates a request (PGN 59904) for `pgn`, sent from `source` to `destination`.
    /// Use [GLOBAL_ADDRESS] as destination for a global request
    pub fn request(pgn: u32, source: u8, destination: u8) -> Self {
        Self {
            id: J1939Id::new(REQUEST_PRIORITY, PGN_REQUEST, Some(destination), source),
            data: vec![pgn as u8, (pgn >> 8) as u8, (pgn >> 16) as u8],
        }
    }

    /// Returns the PGN being requested, if this frame is a request
    pub fn requested_pgn(&self) -> Option<u32> {
        if self.id.pgn != PGN_REQUEST || self.data.len() < 3 {
            return None;
        }
        Some(self.data[0] as u32 | (self.data[1] as u32) << 8 | (self.data[2] as u32) << 16)
    }

    /// Destination of the frame. [GLOBAL_ADDRESS] for broadcast frames
    pub fn destination(&self) -> u8 {
        self.id.destination.unwrap_or(GLOBAL_ADDRESS)
    }

    /// Returns true if this frame is addressed to every node
    pub fn is_global(&self) -> bool {
        self.destination() == GLOBAL_ADDRESS
    }
}

/// Access to one physical J1939 network.
///
/// All operations are blocking. A transport is exclusively owned by one
/// caller for the duration of a test run; the bus is half-duplex and shared, so
/// interleaved requests would make attributing responses impossible.
pub trait BusTransport: Send {
    /// Writes a single frame to the bus
    fn send(&mut self, frame: &RequestFrame) -> ChannelResult<()>;

    /// Collects every packet arriving within `timeout`, in arrival order.
    ///
    /// ## Parameters
    /// * filter - If set, only packets of this PGN are returned
    /// * timeout - Listening window. An empty result is not an error
    fn receive(&mut self, filter: Option<u32>, timeout: Duration) -> ChannelResult<Vec<RawPacket>>;

    /// Listens for `timeout` and returns the first well formed acknowledgment seen
    fn receive_acknowledgment(&mut self, timeout: Duration) -> ChannelResult<Option<Acknowledgment>> {
        Ok(self
            .receive(Some(PGN_ACKNOWLEDGMENT), timeout)?
            .iter()
            .find_map(|p| Acknowledgment::parse(p).ok()))
    }

    /// Sets how long a single [BusTransport::send] may block before failing with
    /// [ChannelError::WriteTimeout]. Transports which never block ignore it
    fn set_write_timeout(&mut self, _timeout: Duration) -> ChannelResult<()> {
        Ok(())
    }

    /// Tells the transport to drop anything already waiting in its Rx buffer
    fn clear_rx_buffer(&mut self) -> ChannelResult<()>;
}
