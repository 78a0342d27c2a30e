//! Request / response transactions
//!
//! A request either goes to the global address, where any number of nodes may answer,
//! or to one node, which must answer with data or an acknowledgment. Silence is a
//! legitimate result in both cases and is returned as such, never as an error.
//! Only a failure of the transport itself ends a transaction with `Err`.

use std::time::Duration;

use log::{debug, warn};

use crate::{
    BusResult,
    ack::{AckKind, Acknowledgment},
    channel::{BusTransport, GLOBAL_ADDRESS, PGN_ACKNOWLEDGMENT, RequestFrame, TOOL_ADDRESS},
    packet::{DecodedPacket, PacketDecoder, RawPacket},
};

/// Number of times a silent destination specific request is repeated
pub const DS_RETRIES: u32 = 1;

/// Listening windows for requests
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeoutConfig {
    /// How long responses to a global request are collected for
    pub global_window_ms: u32,
    /// How long a node has to answer a destination specific request
    pub ds_window_ms: u32,
    /// Write timeout used by transports which support one
    pub write_timeout_ms: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            global_window_ms: 1000,
            ds_window_ms: 1000,
            write_timeout_ms: 100,
        }
    }
}

/// Frame excluded from a result because it could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedFrame {
    /// Sender of the frame
    pub source: u8,
    /// PGN of the frame
    pub pgn: u32,
    /// Why the frame was rejected
    pub reason: String,
}

/// Result of a global request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalQueryOutcome {
    /// Every response, in arrival order
    pub packets: Vec<DecodedPacket>,
    /// Acknowledgments for the requested PGN, in arrival order
    pub acks: Vec<Acknowledgment>,
    /// Always false. Global requests are never repeated
    pub retry_used: bool,
    /// Responses which were excluded as undecodable
    pub malformed: Vec<MalformedFrame>,
}

impl GlobalQueryOutcome {
    /// Responses from one node
    pub fn packets_from(&self, address: u8) -> Vec<&DecodedPacket> {
        self.packets.iter().filter(|p| p.source() == address).collect()
    }

    /// True if neither data nor acknowledgments arrived
    pub fn is_silent(&self) -> bool {
        self.packets.is_empty() && self.acks.is_empty()
    }
}

/// The single answer to a destination specific request
#[derive(Debug, Clone, PartialEq)]
pub enum TargetedResponse {
    /// Node answered with data
    Packet(DecodedPacket),
    /// Node answered with an acknowledgment
    Ack(Acknowledgment),
}

/// Result of a destination specific request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetedQueryOutcome {
    /// Data or acknowledgment, if the node answered at all
    pub response: Option<TargetedResponse>,
    /// True if the first attempt was silent and the request had to be repeated
    pub retry_used: bool,
    /// Frames from the node which were excluded as undecodable
    pub malformed: Vec<MalformedFrame>,
}

impl TargetedQueryOutcome {
    /// Data response, if any
    pub fn packet(&self) -> Option<&DecodedPacket> {
        match &self.response {
            Some(TargetedResponse::Packet(p)) => Some(p),
            _ => None,
        }
    }

    /// Acknowledgment response, if any
    pub fn ack(&self) -> Option<&Acknowledgment> {
        match &self.response {
            Some(TargetedResponse::Ack(a)) => Some(a),
            _ => None,
        }
    }

    /// True if the node sent neither data nor an acknowledgment
    pub fn is_silent(&self) -> bool {
        self.response.is_none()
    }

    /// True if the node explicitly said the PGN is not supported
    pub fn is_nack(&self) -> bool {
        self.ack().is_some_and(|a| a.kind == AckKind::Nack)
    }
}

/// Sends requests and collects the responses to them
pub struct RequestLayer<'a> {
    transport: &'a mut dyn BusTransport,
    decoder: &'a dyn PacketDecoder,
    tool_address: u8,
    timeouts: TimeoutConfig,
}

impl std::fmt::Debug for RequestLayer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLayer")
            .field("tool_address", &self.tool_address)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl<'a> RequestLayer<'a> {
    /// Creates a request layer sending from [TOOL_ADDRESS]
    pub fn new(transport: &'a mut dyn BusTransport, decoder: &'a dyn PacketDecoder) -> Self {
        Self {
            transport,
            decoder,
            tool_address: TOOL_ADDRESS,
            timeouts: TimeoutConfig::default(),
        }
    }

    /// Sets the address requests are sent from
    pub fn with_tool_address(mut self, address: u8) -> Self {
        self.tool_address = address;
        self
    }

    /// Sets the listening windows
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Address requests are sent from
    pub fn tool_address(&self) -> u8 {
        self.tool_address
    }

    /// Listens without sending anything
    pub(crate) fn listen(&mut self, window: Duration) -> BusResult<Vec<RawPacket>> {
        Ok(self.transport.receive(None, window)?)
    }

    pub(crate) fn decode(&self, raw: &RawPacket) -> Option<DecodedPacket> {
        match self.decoder.decode(raw) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("Dropping malformed frame from 0x{:02X}: {e}", raw.source());
                None
            }
        }
    }

    /// Requests `pgn` from every node.
    ///
    /// Every response arriving within the global window is kept, whichever node it came
    /// from. Zero responses is a legitimate result. Global requests are never repeated
    pub fn global_pull(&mut self, pgn: u32) -> BusResult<GlobalQueryOutcome> {
        let request = RequestFrame::request(pgn, self.tool_address, GLOBAL_ADDRESS);
        let window = Duration::from_millis(self.timeouts.global_window_ms as u64);
        let received = self.send_and_listen(&request, window)?;

        let mut outcome = GlobalQueryOutcome::default();
        for raw in received {
            match self.classify(pgn, &raw) {
                Some(Ok(TargetedResponse::Packet(p))) => outcome.packets.push(p),
                Some(Ok(TargetedResponse::Ack(a))) => outcome.acks.push(a),
                Some(Err(m)) => outcome.malformed.push(m),
                None => {}
            }
        }
        debug!(
            "Global request for PGN {pgn}: {} responses, {} acknowledgments",
            outcome.packets.len(),
            outcome.acks.len()
        );
        Ok(outcome)
    }

    /// Requests `pgn` from the node at `address`.
    ///
    /// The first data packet or acknowledgment from that node ends the transaction.
    /// If the node is silent, the request is repeated once and `retry_used` is set.
    /// A NACK, Busy or Denied answer is final
    pub fn targeted_pull(&mut self, pgn: u32, address: u8) -> BusResult<TargetedQueryOutcome> {
        let request = RequestFrame::request(pgn, self.tool_address, address);
        let window = Duration::from_millis(self.timeouts.ds_window_ms as u64);
        let mut outcome = TargetedQueryOutcome::default();

        for attempt in 0..=DS_RETRIES {
            if attempt > 0 {
                warn!("No response from 0x{address:02X} for PGN {pgn}, repeating request");
                outcome.retry_used = true;
            }
            let received = self.send_and_listen(&request, window)?;
            for raw in received.iter().filter(|r| r.source() == address) {
                match self.classify(pgn, raw) {
                    Some(Ok(response)) => {
                        outcome.response = Some(response);
                        return Ok(outcome);
                    }
                    Some(Err(m)) => outcome.malformed.push(m),
                    None => {}
                }
            }
        }
        debug!("DS request for PGN {pgn} to 0x{address:02X} went unanswered");
        Ok(outcome)
    }

    fn send_and_listen(&mut self, request: &RequestFrame, window: Duration) -> BusResult<Vec<RawPacket>> {
        self.transport.clear_rx_buffer()?;
        self.transport
            .set_write_timeout(Duration::from_millis(self.timeouts.write_timeout_ms as u64))?;
        debug!("Sending request {:02X?} to 0x{:02X}", request.data, request.destination());
        self.transport.send(request)?;
        Ok(self.transport.receive(None, window)?)
    }

    /// Sorts a received frame into data / acknowledgment for `pgn`.
    /// Returns None for unrelated traffic, including acknowledgments meant for
    /// another requester
    fn classify(&self, pgn: u32, raw: &RawPacket) -> Option<Result<TargetedResponse, MalformedFrame>> {
        if raw.pgn() == PGN_ACKNOWLEDGMENT {
            return match Acknowledgment::parse(raw) {
                Ok(ack) if ack.pgn == pgn && ack.requester == self.tool_address => {
                    Some(Ok(TargetedResponse::Ack(ack)))
                }
                Ok(ack) => {
                    debug!(
                        "Ignoring acknowledgment from 0x{:02X} for PGN {} to 0x{:02X}",
                        ack.source, ack.pgn, ack.requester
                    );
                    None
                }
                Err(e) => {
                    warn!("Dropping malformed acknowledgment from 0x{:02X}: {e}", raw.source());
                    Some(Err(MalformedFrame {
                        source: raw.source(),
                        pgn: PGN_ACKNOWLEDGMENT,
                        reason: e.to_string(),
                    }))
                }
            };
        }
        if raw.pgn() != pgn {
            return None;
        }
        match self.decoder.decode(raw) {
            Ok(p) => Some(Ok(TargetedResponse::Packet(p))),
            Err(e) => {
                warn!("Dropping malformed response from 0x{:02X}: {e}", raw.source());
                Some(Err(MalformedFrame {
                    source: raw.source(),
                    pgn,
                    reason: e.to_string(),
                }))
            }
        }
    }
}
