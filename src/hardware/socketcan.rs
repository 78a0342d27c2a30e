//! SocketCAN module
//!
//! Raw CAN access to a J1939 network. Multi-packet responses are reassembled
//! in software, see [super::transport_protocol].

use std::{
    io::ErrorKind,
    path::PathBuf,
    time::{Duration, Instant},
};

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket};

use crate::{
    channel::{BusTransport, ChannelError, ChannelResult, J1939Id, RequestFrame, TOOL_ADDRESS},
    clock::{Clock, SystemClock},
    packet::RawPacket,
};

use super::{
    HardwareError, HardwareResult,
    transport_protocol::{TpEvent, TransportReassembler},
};

/// Shortest read timeout handed to the socket. A zero timeout blocks forever,
/// and the kernel rounds anything below a microsecond down to zero
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Read timeout for the time left until `deadline`. None once the window is over
fn read_slice(deadline: Instant, now: Instant) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(now);
    (remaining >= MIN_READ_TIMEOUT).then_some(remaining)
}

/// J1939 transport over a SocketCAN interface
pub struct SocketCanBus {
    if_name: String,
    socket: Option<CanSocket>,
    clock: SystemClock,
    reassembler: TransportReassembler,
    write_timeout: Duration,
}

impl std::fmt::Debug for SocketCanBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanBus")
            .field("if_name", &self.if_name)
            .field("open", &self.socket.is_some())
            .field("reassembler", &self.reassembler)
            .finish()
    }
}

impl SocketCanBus {
    /// Opens the interface `if_name` (EG: `can0`).
    ///
    /// Packet timestamps are taken from `clock`, which should be the clock handed
    /// to [crate::BusService]
    pub fn open(if_name: &str, clock: SystemClock) -> HardwareResult<Self> {
        if !PathBuf::from(format!("/sys/class/net/{if_name}")).exists() {
            return Err(HardwareError::DeviceNotFound);
        }
        let socket = CanSocket::open(if_name).map_err(|e| HardwareError::APIError {
            code: e.raw_os_error().unwrap_or_default() as u32,
            desc: e.to_string(),
        })?;
        log::info!("Opened SocketCAN interface {if_name}");
        Ok(Self {
            if_name: if_name.to_string(),
            socket: Some(socket),
            clock,
            reassembler: TransportReassembler::new(TOOL_ADDRESS),
            write_timeout: Duration::from_millis(100),
        })
    }

    /// Address transport protocol sessions are accepted for. Must match the
    /// address requests are sent from
    pub fn with_tool_address(mut self, address: u8) -> Self {
        self.reassembler = TransportReassembler::new(address);
        self
    }

    /// Sets how long a frame write may block
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Closes the interface
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            log::info!("Closed SocketCAN interface {}", self.if_name);
        }
        self.reassembler.reset();
    }

    fn safe_with_iface<X, T: FnOnce(&CanSocket) -> ChannelResult<X>>(&self, function: T) -> ChannelResult<X> {
        match self.socket {
            Some(ref socket) => function(socket),
            None => Err(ChannelError::InterfaceNotOpen),
        }
    }

    fn write(&self, frame: &RequestFrame) -> ChannelResult<()> {
        let id = ExtendedId::new(frame.id.to_raw()).ok_or(ChannelError::UnsupportedRequest)?;
        let cf = CanFrame::new(id, &frame.data).ok_or(ChannelError::UnsupportedRequest)?;
        self.safe_with_iface(|socket| {
            socket.set_write_timeout(self.write_timeout)?;
            socket.write_frame(&cf).map_err(|e| match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut => ChannelError::WriteTimeout,
                ErrorKind::NotConnected | ErrorKind::BrokenPipe => ChannelError::Disconnected,
                _ => ChannelError::IOError(e),
            })
        })
    }

    /// Reads one frame, waiting at most `timeout`. None if nothing arrived
    fn read(&self, timeout: Duration) -> ChannelResult<Option<RawPacket>> {
        self.safe_with_iface(|socket| {
            socket.set_read_timeout(timeout)?;
            let frame = match socket.read_frame() {
                Ok(f) => f,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return Ok(None),
                Err(e) if e.kind() == ErrorKind::NetworkDown => return Err(ChannelError::Disconnected),
                Err(e) => return Err(e.into()),
            };
            let CanFrame::Data(data_frame) = frame else {
                return Ok(None);
            };
            let Id::Extended(id) = EmbeddedFrame::id(&data_frame) else {
                return Ok(None);
            };
            Ok(Some(RawPacket::new(
                J1939Id::from_raw(id.as_raw()),
                EmbeddedFrame::data(&data_frame),
                self.clock.now(),
            )))
        })
    }
}

impl BusTransport for SocketCanBus {
    fn send(&mut self, frame: &RequestFrame) -> ChannelResult<()> {
        log::debug!("CAN Out -> {:08X} {:02X?}", frame.id.to_raw(), frame.data);
        self.write(frame)
    }

    fn receive(&mut self, filter: Option<u32>, timeout: Duration) -> ChannelResult<Vec<RawPacket>> {
        let deadline = Instant::now() + timeout;
        let mut packets = Vec::new();
        loop {
            let Some(remaining) = read_slice(deadline, Instant::now()) else {
                break;
            };
            let Some(raw) = self.read(remaining)? else {
                continue;
            };
            if !TransportReassembler::is_transport_frame(&raw) {
                packets.push(raw);
                continue;
            }
            for event in self.reassembler.process(&raw) {
                match event {
                    TpEvent::Complete(p) => packets.push(p),
                    TpEvent::Reply(f) => self.write(&f)?,
                }
            }
        }
        if let Some(pgn) = filter {
            packets.retain(|p| p.pgn() == pgn);
        }
        for p in &packets {
            log::debug!("CAN In  <- {:08X} {:02X?}", p.id.to_raw(), p.data);
        }
        Ok(packets)
    }

    fn set_write_timeout(&mut self, timeout: Duration) -> ChannelResult<()> {
        self.write_timeout = timeout;
        Ok(())
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.reassembler.reset();
        self.safe_with_iface(|socket| {
            socket.set_nonblocking(true)?;
            while socket.read_frame().is_ok() {}
            socket.set_nonblocking(false)?;
            Ok(())
        })
    }
}

impl Drop for SocketCanBus {
    fn drop(&mut self) {
        self.close();
    }
}
