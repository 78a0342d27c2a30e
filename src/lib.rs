#![warn(
    missing_docs,
    missing_debug_implementations,
    trivial_numeric_casts,
    //unstable_features,
    //unused_imports,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which provides the bus query and validation layer of a SAE J1939-84 OBD
//! compliance tester, as well as hardware APIs for talking to a J1939 (29bit CAN) network
//!
//! ## What this crate does
//!
//! J1939-84 test steps need diagnostic parameters (SPNs) from every OBD module on a vehicle,
//! and need to judge how those modules behave on the bus. This crate provides
//!
//! * A parameter catalog, mapping SPNs to the PGNs which carry them, and telling which
//!   PGNs are broadcast periodically (And how often) versus only sent on request
//! * Request / response transactions, both global and destination specific (DS), with
//!   acknowledgment handling and a single retry for silent DS requests
//! * A bus query service, which listens to the bus, works out what still needs requesting
//!   and requests it, recording everything notable as a [bus_service::QueryFinding]
//! * A broadcast periodicity validator, which checks each broadcast PGN against its mandated rate
//!
//! ## Hardware support
//!
//! Anything implementing [channel::BusTransport] can be used. This crate provides
//!
//! ### SocketCAN (Linux only)
//! Raw CAN access to a J1939 network, with J1939-21 transport protocol reassembly
//! for multi-packet (BAM and RTS/CTS) responses
//!
//! ### Simulation
//! A scripted vehicle running on a virtual clock, for testing without a vehicle

use channel::ChannelError;
use hardware::HardwareError;

pub mod ack;
pub mod addresses;
pub mod bus_service;
pub mod catalog;
pub mod channel;
pub mod clock;
pub mod hardware;
pub mod listener;
pub mod packet;
pub mod periodicity;
pub mod registry;
pub mod transaction;

pub use bus_service::{BusService, BusServiceOptions, ParameterSweep, QueryFinding};
pub use catalog::ParameterCatalog;
pub use packet::{CatalogDecoder, DecodedPacket, RawPacket, SpnValue};
pub use periodicity::BroadcastValidator;
pub use transaction::{RequestLayer, TimeoutConfig};

/// Bus query result
pub type BusResult<T> = Result<T, J1939Error>;

#[derive(Debug, thiserror::Error)]
/// Error which ends a bus operation.
///
/// Nodes that do not answer, or answer badly, are not errors. Those are reported
/// as [QueryFinding]s
pub enum J1939Error {
    /// Error with underlying communication channel
    #[error("J1939 bus channel error")]
    ChannelError(
        #[from]
        #[source]
        ChannelError,
    ),
    /// Device hardware error
    #[error("J1939 bus hardware error")]
    HardwareError(
        #[from]
        #[source]
        HardwareError,
    ),
    /// Operation was cancelled by the stop flag
    #[error("Bus operation was aborted")]
    Aborted,
}
