//! Bus query service
//!
//! This is what test steps talk to. It decides which PGNs have to be requested at all,
//! listens to the bus, requests the rest globally and then per module, and turns
//! whatever came back (Or didn't) into [QueryFinding]s.
//!
//! A parameter seen on broadcast is never requested again, and a parameter seen in
//! a global response is not requested again from the node which sent it.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    BusResult, J1939Error,
    ack::AckKind,
    addresses::module_label,
    catalog::ParameterCatalog,
    channel::{BusTransport, TOOL_ADDRESS},
    clock::Clock,
    listener::{Outcome, ResultsListener},
    packet::{DecodedPacket, PacketDecoder, SpnValue},
    periodicity::{BroadcastValidator, DEFAULT_JITTER_TOLERANCE},
    registry::ModuleRegistry,
    transaction::{GlobalQueryOutcome, RequestLayer, TargetedQueryOutcome, TargetedResponse, TimeoutConfig},
};

/// PGNs which are only ever requested, whatever the catalog says about them.
/// (HOURS, LFC, CI, VI, SOFT, ECUID)
pub const DEFAULT_ON_REQUEST_PGNS: [u32; 6] = [65253, 65257, 65259, 65260, 65242, 64965];

/// Bus service configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BusServiceOptions {
    /// Address requests are sent from
    pub tool_address: u8,
    /// Listening windows
    pub timeouts: TimeoutConfig,
    /// Factor applied to mandated broadcast rates before a gap is a violation
    pub jitter_tolerance: f64,
    /// PGNs excluded from broadcast collection. See [DEFAULT_ON_REQUEST_PGNS]
    pub on_request_pgns: Vec<u32>,
}

impl Default for BusServiceOptions {
    fn default() -> Self {
        Self {
            tool_address: TOOL_ADDRESS,
            timeouts: TimeoutConfig::default(),
            jitter_tolerance: DEFAULT_JITTER_TOLERANCE,
            on_request_pgns: DEFAULT_ON_REQUEST_PGNS.to_vec(),
        }
    }
}

/// Something notable about how a node answered (Or failed to answer) a request.
///
/// These are results, not errors. Steps decide what to do with them
#[derive(Debug, Clone, PartialEq)]
pub enum QueryFinding {
    /// Neither data nor an acknowledgment arrived, even after the retry
    NoResponse {
        /// Requested PGN
        pgn: u32,
        /// Node which was asked
        address: u8,
    },
    /// Node said it does not support the PGN
    NegativeAcknowledged {
        /// Requested PGN
        pgn: u32,
        /// Node which was asked
        address: u8,
    },
    /// Node said it is busy
    Busy {
        /// Requested PGN
        pgn: u32,
        /// Node which was asked
        address: u8,
    },
    /// Node denied access to the PGN
    Denied {
        /// Requested PGN
        pgn: u32,
        /// Node which was asked
        address: u8,
    },
    /// A response could not be decoded and was ignored
    MalformedFrame {
        /// PGN of the frame
        pgn: u32,
        /// Sender of the frame
        address: u8,
        /// Decoder error
        reason: String,
    },
    /// A destination specific answer disagrees with what the same node broadcast
    /// or sent in response to a global request
    InconsistentResponse {
        /// PGN of the destination specific answer
        pgn: u32,
        /// Node which answered
        address: u8,
        /// Parameter that differs
        spn: u32,
        /// Value seen first
        expected: SpnValue,
        /// Value in the destination specific answer
        received: SpnValue,
    },
    /// The first destination specific request went unanswered, and the repeat was
    /// answered
    RetryRequired {
        /// Requested PGN
        pgn: u32,
        /// Node which was asked
        address: u8,
    },
    /// The destination specific request was still unanswered after its retry
    RetryExhausted {
        /// Requested PGN
        pgn: u32,
        /// Node which was asked
        address: u8,
    },
}

impl QueryFinding {
    /// How the finding is reported
    pub fn severity(&self) -> Outcome {
        match self {
            Self::NoResponse { .. } | Self::InconsistentResponse { .. } => Outcome::Fail,
            Self::NegativeAcknowledged { .. } => Outcome::Info,
            Self::Busy { .. }
            | Self::Denied { .. }
            | Self::MalformedFrame { .. }
            | Self::RetryRequired { .. }
            | Self::RetryExhausted { .. } => Outcome::Warn,
        }
    }

    /// Node the finding is about
    pub fn address(&self) -> u8 {
        match self {
            Self::NoResponse { address, .. }
            | Self::NegativeAcknowledged { address, .. }
            | Self::Busy { address, .. }
            | Self::Denied { address, .. }
            | Self::MalformedFrame { address, .. }
            | Self::InconsistentResponse { address, .. }
            | Self::RetryRequired { address, .. }
            | Self::RetryExhausted { address, .. } => *address,
        }
    }

    /// PGN the finding is about
    pub fn pgn(&self) -> u32 {
        match self {
            Self::NoResponse { pgn, .. }
            | Self::NegativeAcknowledged { pgn, .. }
            | Self::Busy { pgn, .. }
            | Self::Denied { pgn, .. }
            | Self::MalformedFrame { pgn, .. }
            | Self::InconsistentResponse { pgn, .. }
            | Self::RetryRequired { pgn, .. }
            | Self::RetryExhausted { pgn, .. } => *pgn,
        }
    }
}

impl std::fmt::Display for QueryFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoResponse { pgn, address } => {
                write!(f, "No response from {} for PGN {pgn}", module_label(*address))
            }
            Self::NegativeAcknowledged { pgn, address } => {
                write!(f, "{} NACKed PGN {pgn}", module_label(*address))
            }
            Self::Busy { pgn, address } => {
                write!(f, "{} responded busy to PGN {pgn}", module_label(*address))
            }
            Self::Denied { pgn, address } => {
                write!(f, "{} denied access to PGN {pgn}", module_label(*address))
            }
            Self::MalformedFrame { pgn, address, reason } => {
                write!(f, "Malformed PGN {pgn} from {}: {reason}", module_label(*address))
            }
            Self::InconsistentResponse {
                pgn,
                address,
                spn,
                expected,
                received,
            } => write!(
                f,
                "Difference in SPN {spn} of PGN {pgn} from {}: {expected} vs DS {received}",
                module_label(*address)
            ),
            Self::RetryRequired { pgn, address } => write!(
                f,
                "Retry was required to obtain PGN {pgn} from {}",
                module_label(*address)
            ),
            Self::RetryExhausted { pgn, address } => write!(
                f,
                "Retry exhausted requesting PGN {pgn} from {}",
                module_label(*address)
            ),
        }
    }
}

/// Everything gathered by [BusService::collect_parameters]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSweep {
    /// Packets seen during the passive read, in arrival order
    pub broadcast: Vec<DecodedPacket>,
    /// Global request results, by PGN
    pub global: BTreeMap<u32, GlobalQueryOutcome>,
    /// Destination specific request results, by (address, PGN)
    pub targeted: BTreeMap<(u8, u32), TargetedQueryOutcome>,
    /// Findings, in the order they were made
    pub findings: Vec<QueryFinding>,
    /// Required SPNs each module never provided
    pub unresolved: BTreeMap<u8, Vec<u32>>,
}

impl ParameterSweep {
    /// Every data packet the node at `address` sent, broadcast first
    pub fn packets_from(&self, address: u8) -> Vec<&DecodedPacket> {
        let mut packets: Vec<&DecodedPacket> =
            self.broadcast.iter().filter(|p| p.source() == address).collect();
        for outcome in self.global.values() {
            packets.extend(outcome.packets_from(address));
        }
        packets.extend(
            self.targeted
                .iter()
                .filter(|((a, _), _)| *a == address)
                .filter_map(|(_, o)| o.packet()),
        );
        packets
    }

    /// Most recent value of `spn` sent by the node at `address`
    pub fn value_of(&self, address: u8, spn: u32) -> Option<&SpnValue> {
        self.packets_from(address)
            .into_iter()
            .rev()
            .find_map(|p| p.value_of(spn))
    }

    /// True if every required SPN was obtained from every module
    pub fn is_complete(&self) -> bool {
        self.unresolved.values().all(Vec::is_empty)
    }
}

/// Queries the bus on behalf of test steps
pub struct BusService<'a> {
    requests: RequestLayer<'a>,
    catalog: &'a ParameterCatalog,
    validator: BroadcastValidator<'a>,
    clock: &'a dyn Clock,
    on_request_pgns: BTreeSet<u32>,
    stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for BusService<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusService")
            .field("requests", &self.requests)
            .field("validator", &self.validator)
            .field("on_request_pgns", &self.on_request_pgns)
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .finish()
    }
}

impl<'a> BusService<'a> {
    /// Creates a new bus service. The transport stays borrowed for as long as the
    /// service exists, so nothing else can use the bus in the meantime
    pub fn new(
        transport: &'a mut dyn BusTransport,
        decoder: &'a dyn PacketDecoder,
        catalog: &'a ParameterCatalog,
        clock: &'a dyn Clock,
        options: BusServiceOptions,
    ) -> Self {
        Self {
            requests: RequestLayer::new(transport, decoder)
                .with_tool_address(options.tool_address)
                .with_timeouts(options.timeouts),
            catalog,
            validator: BroadcastValidator::new(catalog).with_jitter_tolerance(options.jitter_tolerance),
            clock,
            on_request_pgns: options.on_request_pgns.into_iter().collect(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Uses `flag` to cancel long running operations. Setting it to true makes the
    /// next bus operation return [J1939Error::Aborted]. An operation already in
    /// progress is allowed to finish
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = flag;
        self
    }

    /// Handle to the stop flag
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Periodicity validator configured with this service's catalog and jitter tolerance
    pub fn validator(&self) -> &BroadcastValidator<'a> {
        &self.validator
    }

    fn check_stop(&self) -> BusResult<()> {
        if self.stop.load(Ordering::Relaxed) {
            warn!("Stop requested, aborting bus operation");
            Err(J1939Error::Aborted)
        } else {
            Ok(())
        }
    }

    /// Listens to the bus for `window`, reporting progress once a second.
    ///
    /// Returns every decodable packet that arrived, in arrival order
    pub fn passive_read(
        &mut self,
        window: Duration,
        listener: &mut dyn ResultsListener,
    ) -> BusResult<Vec<DecodedPacket>> {
        self.check_stop()?;
        let start = self.clock.now();
        let mut remaining = window;
        let mut packets = Vec::new();
        while !remaining.is_zero() {
            let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            listener.on_progress(&format!("Reading bus for {secs} seconds"));
            let slice = remaining.min(Duration::from_secs(1));
            for raw in self.requests.listen(slice)? {
                if raw.timestamp < start {
                    debug!("Ignoring stale frame from 0x{:02X}", raw.source());
                    continue;
                }
                if let Some(p) = self.requests.decode(&raw) {
                    packets.push(p);
                }
            }
            remaining -= slice;
        }
        info!(
            "Passive read of {} ms done after {} ms, {} packets",
            window.as_millis(),
            self.clock.now().saturating_sub(start).as_millis(),
            packets.len()
        );
        Ok(packets)
    }

    /// PGNs carrying any of `spns`, minus the request only PGNs. Ascending, deduplicated
    pub fn pgns_needing_request(&self, spns: &[u32]) -> Vec<u32> {
        self.catalog
            .pgns_for_spns(spns)
            .into_iter()
            .filter(|pgn| !self.on_request_pgns.contains(pgn))
            .collect()
    }

    /// The periodic PGNs of `pgns`, in their original order
    pub fn broadcast_capable_of(&self, pgns: &[u32]) -> Vec<u32> {
        pgns.iter()
            .copied()
            .filter(|pgn| self.catalog.is_periodic_broadcast(*pgn))
            .collect()
    }

    /// PGNs which have to be requested to obtain every SPN of `all_required`
    /// not in `already_covered`. Ascending, deduplicated
    pub fn pgns_for_ds_request(&self, already_covered: &[u32], all_required: &[u32]) -> Vec<u32> {
        let covered: BTreeSet<u32> = already_covered.iter().copied().collect();
        let missing: Vec<u32> = all_required
            .iter()
            .copied()
            .filter(|spn| !covered.contains(spn))
            .collect();
        self.catalog.pgns_for_spns(&missing).into_iter().collect()
    }

    /// Requests `pgn` from every node
    pub fn global_pull(&mut self, pgn: u32, listener: &mut dyn ResultsListener) -> BusResult<GlobalQueryOutcome> {
        self.check_stop()?;
        listener.on_progress(&format!("Global Request for PGN {pgn}"));
        self.requests.global_pull(pgn)
    }

    /// Requests `pgn` from the node at `address`, repeating once on silence
    pub fn targeted_pull(
        &mut self,
        pgn: u32,
        address: u8,
        listener: &mut dyn ResultsListener,
    ) -> BusResult<TargetedQueryOutcome> {
        self.check_stop()?;
        listener.on_progress(&format!("DS Request for PGN {pgn} to {}", module_label(address)));
        self.requests.targeted_pull(pgn, address)
    }

    /// Obtains `spns` from every module in `modules`.
    ///
    /// 1. Listen for the longest broadcast period in the catalog
    /// 2. Globally request every PGN still carrying an SPN nobody sent
    /// 3. Request, per module, every PGN still carrying an SPN that module should have sent
    ///
    /// A module is only asked for the SPNs it claims to support
    pub fn collect_parameters(
        &mut self,
        spns: &[u32],
        modules: &dyn ModuleRegistry,
        listener: &mut dyn ResultsListener,
    ) -> BusResult<ParameterSweep> {
        let mut sweep = ParameterSweep::default();

        let window = self.validator.maximum_broadcast_period();
        sweep.broadcast = self.passive_read(window, listener)?;
        let mut seen: BTreeMap<u8, BTreeMap<u32, SpnValue>> = BTreeMap::new();
        record_values(&mut seen, &sweep.broadcast);

        let seen_anywhere: Vec<u32> = seen.values().flat_map(|m| m.keys().copied()).collect();
        for pgn in self.pgns_for_ds_request(&seen_anywhere, spns) {
            let outcome = self.global_pull(pgn, listener)?;
            record_values(&mut seen, &outcome.packets);
            for m in &outcome.malformed {
                sweep.findings.push(QueryFinding::MalformedFrame {
                    pgn: m.pgn,
                    address: m.source,
                    reason: m.reason.clone(),
                });
            }
            sweep.global.insert(pgn, outcome);
        }

        for module in modules.obd_modules() {
            let address = module.source_address;
            let required: Vec<u32> = spns.iter().copied().filter(|s| module.supports(*s)).collect();
            let covered: Vec<u32> = seen
                .get(&address)
                .map(|m| m.keys().copied().collect())
                .unwrap_or_default();
            for pgn in self.pgns_for_ds_request(&covered, &required) {
                let outcome = self.targeted_pull(pgn, address, listener)?;
                let expected = seen.get(&address).cloned().unwrap_or_default();
                sweep
                    .findings
                    .extend(targeted_findings(pgn, address, &outcome, &expected));
                if let Some(p) = outcome.packet() {
                    record_values(&mut seen, std::slice::from_ref(p));
                }
                sweep.targeted.insert((address, pgn), outcome);
            }
            let missing: Vec<u32> = required
                .into_iter()
                .filter(|s| !seen.get(&address).is_some_and(|m| m.contains_key(s)))
                .collect();
            if !missing.is_empty() {
                debug!("{} did not provide SPNs {missing:?}", module_label(address));
            }
            sweep.unresolved.insert(address, missing);
        }
        Ok(sweep)
    }

    /// Requests `pgn` globally, then from each module, and compares what each module
    /// sent in both cases
    pub fn compare_global_and_ds(
        &mut self,
        pgn: u32,
        modules: &dyn ModuleRegistry,
        listener: &mut dyn ResultsListener,
    ) -> BusResult<Vec<QueryFinding>> {
        let global = self.global_pull(pgn, listener)?;
        let mut seen: BTreeMap<u8, BTreeMap<u32, SpnValue>> = BTreeMap::new();
        record_values(&mut seen, &global.packets);

        let mut findings = Vec::new();
        for address in modules.addresses() {
            let outcome = self.targeted_pull(pgn, address, listener)?;
            let expected = seen.get(&address).cloned().unwrap_or_default();
            findings.extend(targeted_findings(pgn, address, &outcome, &expected));
        }
        Ok(findings)
    }

    /// Reports every finding to `listener` against step `part`.`step`
    pub fn report_findings(
        &self,
        findings: &[QueryFinding],
        listener: &mut dyn ResultsListener,
        part: u8,
        step: u8,
    ) {
        for finding in findings {
            let message = format!("6.{part}.{step} - {finding}");
            listener.on_result(&message);
            listener.add_outcome(part, step, finding.severity(), &message);
        }
    }
}

fn record_values(seen: &mut BTreeMap<u8, BTreeMap<u32, SpnValue>>, packets: &[DecodedPacket]) {
    for p in packets {
        let entry = seen.entry(p.source()).or_default();
        for (spn, value) in &p.values {
            entry.insert(*spn, value.clone());
        }
    }
}

/// Findings for the result of one destination specific request
fn targeted_findings(
    pgn: u32,
    address: u8,
    outcome: &TargetedQueryOutcome,
    expected: &BTreeMap<u32, SpnValue>,
) -> Vec<QueryFinding> {
    let mut findings: Vec<QueryFinding> = outcome
        .malformed
        .iter()
        .map(|m| QueryFinding::MalformedFrame {
            pgn: m.pgn,
            address: m.source,
            reason: m.reason.clone(),
        })
        .collect();
    match (&outcome.response, outcome.retry_used) {
        (None, true) => findings.push(QueryFinding::RetryExhausted { pgn, address }),
        (Some(_), true) => findings.push(QueryFinding::RetryRequired { pgn, address }),
        _ => {}
    }
    match &outcome.response {
        None => findings.push(QueryFinding::NoResponse { pgn, address }),
        Some(TargetedResponse::Ack(ack)) => match ack.kind {
            AckKind::Nack => findings.push(QueryFinding::NegativeAcknowledged { pgn, address }),
            AckKind::Busy => findings.push(QueryFinding::Busy { pgn, address }),
            AckKind::Denied => findings.push(QueryFinding::Denied { pgn, address }),
            AckKind::Ack => {}
        },
        Some(TargetedResponse::Packet(p)) => {
            for (spn, received) in &p.values {
                let Some(previous) = expected.get(spn) else {
                    continue;
                };
                if previous.is_available() && received.is_available() && previous != received {
                    findings.push(QueryFinding::InconsistentResponse {
                        pgn,
                        address,
                        spn: *spn,
                        expected: previous.clone(),
                        received: received.clone(),
                    });
                }
            }
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hardware::simulation::{SimulatedBus, SimulatedClock},
        packet::CatalogDecoder,
    };

    fn with_service<R>(f: impl FnOnce(&mut BusService<'_>) -> R) -> R {
        let catalog = ParameterCatalog::builtin();
        let decoder = CatalogDecoder::new(&catalog);
        let clock = SimulatedClock::new();
        let mut bus = SimulatedBus::new(clock.clone());
        let mut service = BusService::new(&mut bus, &decoder, &catalog, &clock, BusServiceOptions::default());
        f(&mut service)
    }

    #[test]
    fn spn_92_needs_eec2() {
        with_service(|s| {
            assert_eq!(s.pgns_needing_request(&[92]), vec![61443]);
            assert_eq!(s.pgns_needing_request(&[234, 247]), Vec::<u32>::new());
            assert_eq!(s.pgns_needing_request(&[999_999]), Vec::<u32>::new());
        });
    }

    #[test]
    fn collect_non_on_request_pgns() {
        let spns = [
            20, 22, 27, 46, 51, 72, 73, 80, 81, 84, 91, 92, 94, 96, 97, 100, 102, 108, 110, 171, 175, 186, 247,
            1203, 88,
        ];
        with_service(|s| {
            assert_eq!(
                s.pgns_needing_request(&spns),
                vec![
                    3072, 61443, 64916, 65172, 65198, 65262, 65263, 65264, 65265, 65266, 65269, 65270, 65273, 65276,
                    65277, 65278, 65279
                ]
            );
        });
    }

    #[test]
    fn broadcast_capable_keeps_order_and_is_idempotent() {
        with_service(|s| {
            let pgns = [65262, 3072, 61444, 65259, 999, 61443];
            let once = s.broadcast_capable_of(&pgns);
            assert_eq!(once, vec![65262, 61444, 61443]);
            assert_eq!(s.broadcast_capable_of(&once), once);
        });
    }

    #[test]
    fn ds_work_list_ignores_covered_order() {
        with_service(|s| {
            let required = [92, 110, 234, 247, 20];
            let a = s.pgns_for_ds_request(&[110, 92], &required);
            let b = s.pgns_for_ds_request(&[92, 110, 92], &required);
            assert_eq!(a, b);
            assert_eq!(a, vec![3072, 65242, 65253]);
            assert_eq!(a, s.catalog.pgns_for_spns(&[234, 247, 20]).into_iter().collect::<Vec<_>>());
        });
    }

    #[test]
    fn stop_flag_aborts() {
        with_service(|s| {
            s.stop_flag().store(true, Ordering::Relaxed);
            let mut listener = crate::listener::NoOpListener;
            assert!(matches!(s.global_pull(65259, &mut listener), Err(J1939Error::Aborted)));
        });
    }

    #[test]
    fn finding_severity() {
        assert_eq!(QueryFinding::NoResponse { pgn: 1, address: 0 }.severity(), Outcome::Fail);
        assert_eq!(
            QueryFinding::NegativeAcknowledged { pgn: 1, address: 0 }.severity(),
            Outcome::Info
        );
        assert_eq!(QueryFinding::RetryExhausted { pgn: 1, address: 0 }.severity(), Outcome::Warn);
        assert_eq!(QueryFinding::RetryRequired { pgn: 1, address: 0 }.severity(), Outcome::Warn);
        assert_eq!(
            QueryFinding::NoResponse { pgn: 65259, address: 0x00 }.to_string(),
            "No response from Engine #1 (0) for PGN 65259"
        );
    }
}
