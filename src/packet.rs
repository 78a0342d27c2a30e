//! Received J1939 packets, and decoding them into SPN values

use std::time::Duration;

use crate::{
    catalog::{ParameterCatalog, SlotEncoding, SpnSlot},
    channel::J1939Id,
};

/// One frame (Or one reassembled multi-packet message) as it arrived from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Identifier the packet was sent with
    pub id: J1939Id,
    /// Payload bytes
    pub data: Vec<u8>,
    /// Monotonic arrival time, relative to the epoch of the transport's clock
    pub timestamp: Duration,
}

impl RawPacket {
    /// Creates a new packet
    pub fn new(id: J1939Id, data: &[u8], timestamp: Duration) -> Self {
        Self {
            id,
            data: data.to_vec(),
            timestamp,
        }
    }

    /// Source address of the sender
    pub fn source(&self) -> u8 {
        self.id.source
    }

    /// Parameter group number of the packet
    pub fn pgn(&self) -> u32 {
        self.id.pgn
    }
}

/// Value of a single SPN within a packet
#[derive(Debug, Clone, PartialEq)]
pub enum SpnValue {
    /// Scaled value in the SPN's unit
    Value(f64),
    /// ASCII parameter (VIN, make, software ID...)
    Text(String),
    /// Sender signalled that the parameter is not available
    NotAvailable,
    /// Sender signalled an error indicator for the parameter
    Error,
}

impl SpnValue {
    /// Returns the numeric value, if there is one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SpnValue::Value(v) => Some(*v),
            _ => None,
        }
    }

    /// True unless the sender flagged the parameter not available
    pub fn is_available(&self) -> bool {
        !matches!(self, SpnValue::NotAvailable)
    }
}

impl std::fmt::Display for SpnValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpnValue::Value(v) => write!(f, "{v}"),
            SpnValue::Text(t) => write!(f, "{t}"),
            SpnValue::NotAvailable => write!(f, "Not Available"),
            SpnValue::Error => write!(f, "Error"),
        }
    }
}

/// A [RawPacket] together with its SPN values, in slot order
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    /// The packet that was decoded
    pub packet: RawPacket,
    /// SPN values carried by the packet
    pub values: Vec<(u32, SpnValue)>,
}

impl DecodedPacket {
    /// Source address of the sender
    pub fn source(&self) -> u8 {
        self.packet.source()
    }

    /// Parameter group number
    pub fn pgn(&self) -> u32 {
        self.packet.pgn()
    }

    /// Arrival time
    pub fn timestamp(&self) -> Duration {
        self.packet.timestamp
    }

    /// Looks up the value of one SPN
    pub fn value_of(&self, spn: u32) -> Option<&SpnValue> {
        self.values.iter().find(|(id, _)| *id == spn).map(|(_, v)| v)
    }

    /// SPNs present in this packet
    pub fn spns(&self) -> impl Iterator<Item = u32> + '_ {
        self.values.iter().map(|(spn, _)| *spn)
    }
}

/// Reasons a frame could not be turned into a [DecodedPacket] or acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Payload ended before the last slot of the PGN
    #[error("PGN {pgn} payload too short. Expected {expected} bytes, received {received}")]
    Truncated {
        /// PGN being decoded
        pgn: u32,
        /// Bytes required by the slot layout
        expected: usize,
        /// Bytes received
        received: usize,
    },
    /// Acknowledgment control byte is not one of ACK, NACK, Access denied or Busy
    #[error("Invalid acknowledgment control byte 0x{0:02X}")]
    InvalidControlByte(u8),
    /// ASCII field was not valid text
    #[error("PGN {0} contains an invalid ASCII field")]
    InvalidText(u32),
}

/// Turns raw packets into decoded packets. Decoding metadata is owned
/// by the implementor
pub trait PacketDecoder: Send + Sync {
    /// Decodes a packet. PGNs the decoder does not know decode to a packet with no values
    fn decode(&self, packet: &RawPacket) -> Result<DecodedPacket, DecodeError>;
}

/// Decoder driven by the SPN slot layouts of a [ParameterCatalog]
#[derive(Debug, Clone, Copy)]
pub struct CatalogDecoder<'a> {
    catalog: &'a ParameterCatalog,
}

impl<'a> CatalogDecoder<'a> {
    /// Creates a decoder using `catalog`
    pub fn new(catalog: &'a ParameterCatalog) -> Self {
        Self { catalog }
    }
}

impl PacketDecoder for CatalogDecoder<'_> {
    fn decode(&self, packet: &RawPacket) -> Result<DecodedPacket, DecodeError> {
        let values = match self.catalog.definition(packet.pgn()) {
            Some(def) => def
                .slots
                .iter()
                .map(|slot| decode_slot(packet.pgn(), slot, &packet.data).map(|v| (slot.spn, v)))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        Ok(DecodedPacket {
            packet: packet.clone(),
            values,
        })
    }
}

fn decode_slot(pgn: u32, slot: &SpnSlot, data: &[u8]) -> Result<SpnValue, DecodeError> {
    match slot.encoding {
        SlotEncoding::Numeric {
            start_bit,
            bit_length,
            resolution,
            offset,
        } => {
            let end_bit = start_bit as usize + bit_length as usize;
            let expected = end_bit.div_ceil(8);
            if data.len() < expected {
                return Err(DecodeError::Truncated {
                    pgn,
                    expected,
                    received: data.len(),
                });
            }
            let raw = extract_bits(data, start_bit as usize, bit_length as usize);
            Ok(match sentinel(raw, bit_length) {
                Some(v) => v,
                None => SpnValue::Value(raw as f64 * resolution + offset),
            })
        }
        SlotEncoding::Ascii { start_byte, field } => {
            let start = start_byte as usize;
            if data.len() < start {
                return Err(DecodeError::Truncated {
                    pgn,
                    expected: start,
                    received: data.len(),
                });
            }
            match data[start..].split(|b| *b == b'*').nth(field as usize) {
                Some(bytes) => std::str::from_utf8(bytes)
                    .map(|s| SpnValue::Text(s.trim().to_string()))
                    .map_err(|_| DecodeError::InvalidText(pgn)),
                None => Ok(SpnValue::NotAvailable),
            }
        }
    }
}

/// Reads `len` bits starting at bit `start`, J1939 (Little endian) bit order
fn extract_bits(data: &[u8], start: usize, len: usize) -> u64 {
    let mut raw: u64 = 0;
    for i in 0..len {
        let bit = start + i;
        if data[bit / 8] & (1 << (bit % 8)) != 0 {
            raw |= 1 << i;
        }
    }
    raw
}

/// J1939-71 not available / error indicator ranges
fn sentinel(raw: u64, bit_length: u8) -> Option<SpnValue> {
    match bit_length {
        0 | 1 => None,
        2 => match raw {
            0b11 => Some(SpnValue::NotAvailable),
            0b10 => Some(SpnValue::Error),
            _ => None,
        },
        4 => match raw {
            0xF => Some(SpnValue::NotAvailable),
            0xE => Some(SpnValue::Error),
            _ => None,
        },
        l if l >= 8 => match raw >> (l - 8) {
            0xFF => Some(SpnValue::NotAvailable),
            0xFB..=0xFE => Some(SpnValue::Error),
            _ => None,
        },
        l => {
            if raw == (1 << l) - 1 {
                Some(SpnValue::NotAvailable)
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ParameterCatalog;

    fn packet(pgn: u32, source: u8, data: &[u8]) -> RawPacket {
        RawPacket::new(J1939Id::new(6, pgn, None, source), data, Duration::ZERO)
    }

    #[test]
    fn decode_engine_temperature() {
        let catalog = ParameterCatalog::builtin();
        let decoder = CatalogDecoder::new(&catalog);
        // Coolant 90C, fuel temp N/A, oil temp 100C
        let oil = ((100.0 + 273.0) / 0.03125) as u16;
        let data = [130, 0xFF, oil as u8, (oil >> 8) as u8, 0xFF, 0xFF, 0xFF, 0xFF];
        let decoded = decoder.decode(&packet(65262, 0x00, &data)).unwrap();
        assert_eq!(decoded.value_of(110), Some(&SpnValue::Value(90.0)));
        assert_eq!(decoded.value_of(174), Some(&SpnValue::NotAvailable));
        assert_eq!(decoded.value_of(175), Some(&SpnValue::Value(100.0)));
    }

    #[test]
    fn decode_two_bit_status() {
        let catalog = ParameterCatalog::builtin();
        let decoder = CatalogDecoder::new(&catalog);
        // MIL on (01), other lamps off
        let decoded = decoder
            .decode(&packet(65226, 0x00, &[0b0100_0000, 0xFF, 0, 0, 0, 0, 0xFF, 0xFF]))
            .unwrap();
        assert_eq!(decoded.value_of(1213), Some(&SpnValue::Value(1.0)));
        assert_eq!(decoded.value_of(624), Some(&SpnValue::Value(0.0)));
    }

    #[test]
    fn decode_ascii_fields() {
        let catalog = ParameterCatalog::builtin();
        let decoder = CatalogDecoder::new(&catalog);
        let decoded = decoder
            .decode(&packet(65259, 0x00, b"ACME*X15*SN1234*"))
            .unwrap();
        assert_eq!(decoded.value_of(586), Some(&SpnValue::Text("ACME".into())));
        assert_eq!(decoded.value_of(588), Some(&SpnValue::Text("SN1234".into())));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let catalog = ParameterCatalog::builtin();
        let decoder = CatalogDecoder::new(&catalog);
        let err = decoder.decode(&packet(65262, 0x00, &[0x10])).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { pgn: 65262, .. }));
    }

    #[test]
    fn unknown_pgn_has_no_values() {
        let catalog = ParameterCatalog::builtin();
        let decoder = CatalogDecoder::new(&catalog);
        let decoded = decoder.decode(&packet(0xFF00, 0x21, &[1, 2, 3])).unwrap();
        assert!(decoded.values.is_empty());
        assert_eq!(decoded.source(), 0x21);
    }
}
