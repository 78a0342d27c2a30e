//! J1939-21 transport protocol reassembly
//!
//! Responses larger than 8 bytes (Component identification, software ID, DM
//! messages with many DTCs...) are split into TP.DT frames, announced either by a
//! BAM (For global destinations) or a RTS (For a specific destination).
//! For RTS sessions addressed to us, the receiver paces the sender with CTS frames
//! and confirms the complete message with an EndOfMsgAck.

use std::{collections::HashMap, time::Duration};

use log::{debug, warn};

use crate::{
    channel::{GLOBAL_ADDRESS, J1939Id, PGN_TP_CM, PGN_TP_DT, RequestFrame},
    packet::RawPacket,
};

const CM_RTS: u8 = 16;
const CM_CTS: u8 = 17;
const CM_END_OF_MSG_ACK: u8 = 19;
const CM_BAM: u8 = 32;
const CM_ABORT: u8 = 255;

/// Abort reason: Already in a connection managed session
const ABORT_ALREADY_CONNECTED: u8 = 1;
/// Abort reason: Bad sequence number
const ABORT_BAD_SEQUENCE: u8 = 7;

/// Longest gap allowed between two frames of one session (T1)
pub const TP_TIMEOUT: Duration = Duration::from_millis(750);

/// Priority of flow control frames we send
const TP_PRIORITY: u8 = 7;

/// Something the reassembler wants the transport to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpEvent {
    /// A multi-packet message is complete
    Complete(RawPacket),
    /// Flow control frame which must be sent to the bus
    Reply(RequestFrame),
}

#[derive(Debug, Clone)]
struct Session {
    pgn: u32,
    priority: u8,
    size: usize,
    total_packets: u8,
    max_per_cts: u8,
    next_seq: u8,
    window_end: u8,
    broadcast: bool,
    data: Vec<u8>,
    last_rx: Duration,
}

/// Tracks open transport sessions and rebuilds the messages they carry
#[derive(Debug, Clone)]
pub struct TransportReassembler {
    address: u8,
    sessions: HashMap<(u8, u8), Session>,
}

fn cm_frame(control: [u8; 5], pgn: u32, source: u8, destination: u8) -> RequestFrame {
    let mut data = control.to_vec();
    data.extend_from_slice(&[pgn as u8, (pgn >> 8) as u8, (pgn >> 16) as u8]);
    RequestFrame {
        id: J1939Id::new(TP_PRIORITY, PGN_TP_CM, Some(destination), source),
        data,
    }
}

impl TransportReassembler {
    /// Creates a reassembler which accepts RTS sessions addressed to `address`
    pub fn new(address: u8) -> Self {
        Self {
            address,
            sessions: HashMap::new(),
        }
    }

    /// Returns true if the packet belongs to the transport protocol
    pub fn is_transport_frame(packet: &RawPacket) -> bool {
        matches!(packet.pgn(), PGN_TP_CM | PGN_TP_DT)
    }

    /// Number of sessions currently being received
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Drops every open session
    pub fn reset(&mut self) {
        self.sessions.clear();
    }

    /// Feeds one received frame into the reassembler.
    /// Frames which are not part of the transport protocol produce nothing
    pub fn process(&mut self, packet: &RawPacket) -> Vec<TpEvent> {
        self.expire(packet.timestamp);
        if packet.data.len() < 8 {
            if Self::is_transport_frame(packet) {
                warn!("Ignoring short transport frame from 0x{:02X}", packet.source());
            }
            return Vec::new();
        }
        match packet.pgn() {
            PGN_TP_CM => self.on_connection_frame(packet),
            PGN_TP_DT => self.on_data_frame(packet),
            _ => Vec::new(),
        }
    }

    /// Drops sessions which have not seen a frame for longer than [TP_TIMEOUT]
    pub fn expire(&mut self, now: Duration) {
        self.sessions.retain(|(src, _), s| {
            let alive = now.saturating_sub(s.last_rx) <= TP_TIMEOUT;
            if !alive {
                warn!("Transport session for PGN {} from 0x{src:02X} timed out", s.pgn);
            }
            alive
        });
    }

    fn on_connection_frame(&mut self, packet: &RawPacket) -> Vec<TpEvent> {
        let d = &packet.data;
        let source = packet.source();
        let destination = packet.id.destination.unwrap_or(GLOBAL_ADDRESS);
        let pgn = d[5] as u32 | (d[6] as u32) << 8 | (d[7] as u32) << 16;
        let size = d[1] as usize | (d[2] as usize) << 8;
        match d[0] {
            CM_BAM if destination == GLOBAL_ADDRESS => {
                debug!("BAM for PGN {pgn} ({size} bytes) from 0x{source:02X}");
                self.sessions.insert(
                    (source, GLOBAL_ADDRESS),
                    Session {
                        pgn,
                        priority: packet.id.priority,
                        size,
                        total_packets: d[3],
                        max_per_cts: d[3],
                        next_seq: 1,
                        window_end: d[3],
                        broadcast: true,
                        data: Vec::with_capacity(size),
                        last_rx: packet.timestamp,
                    },
                );
                Vec::new()
            }
            CM_RTS if destination == self.address => {
                if self.sessions.remove(&(source, destination)).is_some() {
                    warn!("Second RTS from 0x{source:02X} while a session is open, aborting");
                    return vec![TpEvent::Reply(cm_frame(
                        [CM_ABORT, ABORT_ALREADY_CONNECTED, 0xFF, 0xFF, 0xFF],
                        pgn,
                        self.address,
                        source,
                    ))];
                }
                let total_packets = d[3];
                let max_per_cts = if d[4] == 0 { total_packets } else { d[4].min(total_packets) };
                debug!("RTS for PGN {pgn} ({size} bytes) from 0x{source:02X}");
                self.sessions.insert(
                    (source, destination),
                    Session {
                        pgn,
                        priority: packet.id.priority,
                        size,
                        total_packets,
                        max_per_cts,
                        next_seq: 1,
                        window_end: max_per_cts,
                        broadcast: false,
                        data: Vec::with_capacity(size),
                        last_rx: packet.timestamp,
                    },
                );
                vec![TpEvent::Reply(cm_frame(
                    [CM_CTS, max_per_cts, 1, 0xFF, 0xFF],
                    pgn,
                    self.address,
                    source,
                ))]
            }
            CM_ABORT => {
                if self.sessions.remove(&(source, destination)).is_some() {
                    warn!("Sender 0x{source:02X} aborted transfer of PGN {pgn}, reason {}", d[1]);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_data_frame(&mut self, packet: &RawPacket) -> Vec<TpEvent> {
        let source = packet.source();
        let key = (source, packet.id.destination.unwrap_or(GLOBAL_ADDRESS));
        let Some(session) = self.sessions.get_mut(&key) else {
            return Vec::new();
        };
        let seq = packet.data[0];
        if seq != session.next_seq {
            warn!(
                "Bad TP sequence from 0x{source:02X}: expected {}, got {seq}",
                session.next_seq
            );
            let pgn = session.pgn;
            let broadcast = session.broadcast;
            self.sessions.remove(&key);
            if broadcast {
                return Vec::new();
            }
            return vec![TpEvent::Reply(cm_frame(
                [CM_ABORT, ABORT_BAD_SEQUENCE, 0xFF, 0xFF, 0xFF],
                pgn,
                self.address,
                source,
            ))];
        }
        session.data.extend_from_slice(&packet.data[1..8]);
        session.last_rx = packet.timestamp;
        session.next_seq = session.next_seq.wrapping_add(1);

        if seq >= session.total_packets || session.data.len() >= session.size {
            let Some(mut done) = self.sessions.remove(&key) else {
                return Vec::new();
            };
            done.data.truncate(done.size);
            let id = J1939Id::new(done.priority, done.pgn, Some(key.1), source);
            let complete = TpEvent::Complete(RawPacket::new(id, &done.data, packet.timestamp));
            if done.broadcast {
                return vec![complete];
            }
            let ack = cm_frame(
                [
                    CM_END_OF_MSG_ACK,
                    done.size as u8,
                    (done.size >> 8) as u8,
                    done.total_packets,
                    0xFF,
                ],
                done.pgn,
                self.address,
                source,
            );
            return vec![TpEvent::Reply(ack), complete];
        }

        if !session.broadcast && seq == session.window_end {
            let remaining = session.total_packets - seq;
            let count = remaining.min(session.max_per_cts);
            session.window_end = seq + count;
            return vec![TpEvent::Reply(cm_frame(
                [CM_CTS, count, seq + 1, 0xFF, 0xFF],
                session.pgn,
                self.address,
                source,
            ))];
        }
        Vec::new()
    }
}
