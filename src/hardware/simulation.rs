//! Simulated J1939 vehicle for unit testing the query layer
//!
//! Time is virtual. Nothing sleeps; [SimulatedBus::receive] advances the shared
//! [SimulatedClock] by the requested window and returns what the scripted nodes would
//! have put on the bus during it.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{
    ack::{AckKind, Acknowledgment},
    channel::{BusTransport, ChannelError, ChannelResult, GLOBAL_ADDRESS, J1939Id, RequestFrame, is_pdu1},
    clock::Clock,
    packet::RawPacket,
};

/// Virtual clock shared between a [SimulatedBus] and the code under test
#[derive(Debug, Clone, Default)]
pub struct SimulatedClock {
    now_us: Arc<AtomicU64>,
}

impl SimulatedClock {
    /// Creates a clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward
    pub fn advance(&self, by: Duration) {
        self.now_us.fetch_add(by.as_micros() as u64, Ordering::Relaxed);
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.now_us.load(Ordering::Relaxed))
    }
}

/// How a simulated node answers one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimResponse {
    /// Answer with this payload
    Data(Vec<u8>),
    /// Answer with an acknowledgment of this kind
    Ack(AckKind),
    /// Do not answer
    Silent,
}

#[derive(Debug, Clone)]
enum Schedule {
    Periodic { phase: Duration, period: Duration },
    At(Vec<Duration>),
}

#[derive(Debug, Clone)]
struct Broadcaster {
    source: u8,
    pgn: u32,
    data: Vec<u8>,
    schedule: Schedule,
}

impl Broadcaster {
    fn times_within(&self, start: Duration, end: Duration) -> Vec<Duration> {
        match &self.schedule {
            Schedule::Periodic { phase, period } => {
                if period.is_zero() {
                    return Vec::new();
                }
                let mut t = *phase;
                if start > t {
                    let missed = (start - t).as_micros().div_ceil(period.as_micros());
                    t += Duration::from_micros((missed * period.as_micros()) as u64);
                }
                let mut times = Vec::new();
                while t < end {
                    times.push(t);
                    t += *period;
                }
                times
            }
            Schedule::At(list) => list.iter().copied().filter(|t| *t >= start && *t < end).collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct Responder {
    source: u8,
    pgn: u32,
    answers_global: bool,
    script: VecDeque<SimResponse>,
}

impl Responder {
    /// Next scripted answer. The last entry repeats forever
    fn next(&mut self) -> SimResponse {
        if self.script.len() > 1 {
            self.script.pop_front().unwrap_or(SimResponse::Silent)
        } else {
            self.script.front().cloned().unwrap_or(SimResponse::Silent)
        }
    }
}

/// Scripted vehicle network
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    clock: SimulatedClock,
    broadcasters: Vec<Broadcaster>,
    responders: Vec<Responder>,
    pending: Vec<RawPacket>,
    sent: Vec<RequestFrame>,
    connected: Arc<AtomicBool>,
    response_latency: Duration,
    write_timeout: Option<Duration>,
}

impl SimulatedBus {
    /// Creates an empty network running on `clock`
    pub fn new(clock: SimulatedClock) -> Self {
        Self {
            clock,
            broadcasters: Vec::new(),
            responders: Vec::new(),
            pending: Vec::new(),
            sent: Vec::new(),
            connected: Arc::new(AtomicBool::new(true)),
            response_latency: Duration::from_millis(10),
            write_timeout: None,
        }
    }

    /// Node `source` broadcasts `data` on `pgn` every `period`, starting at `phase`
    pub fn add_broadcast(&mut self, source: u8, pgn: u32, period: Duration, phase: Duration, data: &[u8]) {
        self.broadcasters.push(Broadcaster {
            source,
            pgn,
            data: data.to_vec(),
            schedule: Schedule::Periodic { phase, period },
        });
    }

    /// Node `source` broadcasts `data` on `pgn` at exactly the given times
    pub fn add_broadcast_at(&mut self, source: u8, pgn: u32, times: &[Duration], data: &[u8]) {
        self.broadcasters.push(Broadcaster {
            source,
            pgn,
            data: data.to_vec(),
            schedule: Schedule::At(times.to_vec()),
        });
    }

    /// Node `source` answers every request for `pgn`, global or destination specific, with `response`
    pub fn respond(&mut self, source: u8, pgn: u32, response: SimResponse) {
        self.respond_sequence(source, pgn, true, vec![response]);
    }

    /// Node `source` answers requests for `pgn` with the scripted responses in order,
    /// repeating the last one. If `answers_global` is false, global requests are ignored
    pub fn respond_sequence(&mut self, source: u8, pgn: u32, answers_global: bool, script: Vec<SimResponse>) {
        self.responders.push(Responder {
            source,
            pgn,
            answers_global,
            script: script.into(),
        });
    }

    /// Queues a raw frame for delivery after `delay`
    pub fn inject(&mut self, id: J1939Id, data: &[u8], delay: Duration) {
        self.pending
            .push(RawPacket::new(id, data, self.clock.now() + delay));
    }

    /// Every frame written to the bus so far
    pub fn sent_frames(&self) -> &[RequestFrame] {
        &self.sent
    }

    /// Last write timeout the bus was configured with
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Handle which disconnects the bus when set to false
    pub fn connection(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    fn check_connected(&self) -> ChannelResult<()> {
        if self.connected.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(ChannelError::Disconnected)
        }
    }

    fn answer(&mut self, frame: &RequestFrame, pgn: u32) {
        let at = self.clock.now() + self.response_latency;
        let destination = frame.destination();
        let mut answers = Vec::new();
        for r in self.responders.iter_mut().filter(|r| r.pgn == pgn) {
            let addressed = if destination == GLOBAL_ADDRESS {
                r.answers_global
            } else {
                destination == r.source
            };
            if !addressed {
                continue;
            }
            match r.next() {
                SimResponse::Data(data) => {
                    let da = is_pdu1(pgn).then_some(frame.id.source);
                    answers.push(RawPacket::new(J1939Id::new(6, pgn, da, r.source), &data, at));
                }
                SimResponse::Ack(kind) => answers.push(
                    Acknowledgment {
                        source: r.source,
                        kind,
                        group_function: 0xFF,
                        requester: frame.id.source,
                        pgn,
                        timestamp: at,
                    }
                    .to_packet(),
                ),
                SimResponse::Silent => {}
            }
        }
        self.pending.extend(answers);
    }
}

impl BusTransport for SimulatedBus {
    fn send(&mut self, frame: &RequestFrame) -> ChannelResult<()> {
        self.check_connected()?;
        log::debug!("Sim Out -> {:08X} {:02X?}", frame.id.to_raw(), frame.data);
        self.sent.push(frame.clone());
        if let Some(pgn) = frame.requested_pgn() {
            self.answer(frame, pgn);
        }
        Ok(())
    }

    fn receive(&mut self, filter: Option<u32>, timeout: Duration) -> ChannelResult<Vec<RawPacket>> {
        self.check_connected()?;
        let start = self.clock.now();
        let end = start + timeout;

        let mut packets: Vec<RawPacket> = Vec::new();
        for b in &self.broadcasters {
            for t in b.times_within(start, end) {
                packets.push(RawPacket::new(J1939Id::new(6, b.pgn, None, b.source), &b.data, t));
            }
        }
        let (due, later): (Vec<RawPacket>, Vec<RawPacket>) =
            self.pending.drain(..).partition(|p| p.timestamp < end);
        self.pending = later;
        packets.extend(due);
        packets.sort_by_key(|p| p.timestamp);
        if let Some(pgn) = filter {
            packets.retain(|p| p.pgn() == pgn);
        }
        for p in &packets {
            log::debug!("Sim In  <- {:08X} {:02X?}", p.id.to_raw(), p.data);
        }
        self.clock.advance(timeout);
        Ok(packets)
    }

    fn set_write_timeout(&mut self, timeout: Duration) -> ChannelResult<()> {
        self.write_timeout = Some(timeout);
        Ok(())
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        let now = self.clock.now();
        self.pending.retain(|p| p.timestamp > now);
        Ok(())
    }
}
