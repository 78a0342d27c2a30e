//! Acknowledgment (PGN 59392) handling

use std::time::Duration;

use crate::{
    channel::{GLOBAL_ADDRESS, J1939Id, PGN_ACKNOWLEDGMENT},
    packet::{DecodeError, RawPacket},
};

/// Acknowledgment response kind (Control byte of PGN 59392)
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AckKind {
    /// Positive acknowledgment
    #[strum(serialize = "ACK")]
    Ack,
    /// Negative acknowledgment. The PGN is not supported
    #[strum(serialize = "NACK")]
    Nack,
    /// Access to the PGN was denied
    #[strum(serialize = "DENIED")]
    Denied,
    /// The node cannot respond right now
    #[strum(serialize = "BUSY")]
    Busy,
}

impl TryFrom<u8> for AckKind {
    type Error = DecodeError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(Self::Ack),
            1 => Ok(Self::Nack),
            2 => Ok(Self::Denied),
            3 => Ok(Self::Busy),
            x => Err(DecodeError::InvalidControlByte(x)),
        }
    }
}

impl From<AckKind> for u8 {
    fn from(k: AckKind) -> Self {
        match k {
            AckKind::Ack => 0,
            AckKind::Nack => 1,
            AckKind::Denied => 2,
            AckKind::Busy => 3,
        }
    }
}

/// Acknowledgment sent by a node in response to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgment {
    /// Node which sent the acknowledgment
    pub source: u8,
    /// Response kind
    pub kind: AckKind,
    /// Group function value
    pub group_function: u8,
    /// Address of the node whose request is being acknowledged
    pub requester: u8,
    /// PGN being acknowledged
    pub pgn: u32,
    /// Arrival time
    pub timestamp: Duration,
}

impl Acknowledgment {
    /// Parses an acknowledgment packet.
    ///
    /// Layout: control, group function, 0xFF, 0xFF, requester address, PGN (3 bytes LE)
    pub fn parse(packet: &RawPacket) -> Result<Self, DecodeError> {
        let d = &packet.data;
        if d.len() < 8 {
            return Err(DecodeError::Truncated {
                pgn: PGN_ACKNOWLEDGMENT,
                expected: 8,
                received: d.len(),
            });
        }
        Ok(Self {
            source: packet.source(),
            kind: AckKind::try_from(d[0])?,
            group_function: d[1],
            requester: d[4],
            pgn: d[5] as u32 | (d[6] as u32) << 8 | (d[7] as u32) << 16,
            timestamp: packet.timestamp,
        })
    }

    /// Builds the packet for this acknowledgment
    pub fn to_packet(&self) -> RawPacket {
        let data = [
            self.kind.into(),
            self.group_function,
            0xFF,
            0xFF,
            self.requester,
            self.pgn as u8,
            (self.pgn >> 8) as u8,
            (self.pgn >> 16) as u8,
        ];
        RawPacket::new(
            J1939Id::new(6, PGN_ACKNOWLEDGMENT, Some(GLOBAL_ADDRESS), self.source),
            &data,
            self.timestamp,
        )
    }
}
