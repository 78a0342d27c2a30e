//! Broadcast periodicity validation
//!
//! Packets seen during a passive read are grouped per PGN for one node. Every
//! pair of consecutive packets in a group is then checked against the PGN's mandated
//! transmission rate. Only arrival order matters, so grouping must never reorder packets.

use std::{collections::BTreeMap, time::Duration};

use crate::{
    addresses::module_label,
    catalog::ParameterCatalog,
    listener::{Outcome, ResultsListener},
    packet::DecodedPacket,
};

/// Default factor applied to a mandated rate before a gap counts as a violation
pub const DEFAULT_JITTER_TOLERANCE: f64 = 1.1;

/// How much of a (PGN, node) broadcast was observed in a window
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ObservationState {
    /// No packet arrived
    NeverSeen,
    /// Exactly one packet arrived. Presence is known, the period is not
    SeenOnce,
    /// Two or more packets arrived
    PeriodMeasurable,
}

impl ObservationState {
    /// Next state after one more packet arrives
    pub fn observe(self) -> Self {
        match self {
            Self::NeverSeen => Self::SeenOnce,
            Self::SeenOnce | Self::PeriodMeasurable => Self::PeriodMeasurable,
        }
    }
}

/// Arrival times of one PGN from one node during a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastObservation {
    /// Observed PGN
    pub pgn: u32,
    /// Sending node
    pub source: u8,
    /// Arrival times, in arrival order
    pub timestamps: Vec<Duration>,
    /// Observation state after the window
    pub state: ObservationState,
}

impl BroadcastObservation {
    /// Gaps between consecutive arrivals
    pub fn deltas(&self) -> Vec<Duration> {
        self.timestamps
            .windows(2)
            .map(|w| w[1].saturating_sub(w[0]))
            .collect()
    }
}

/// A gap between two broadcasts that was longer than allowed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodViolation {
    /// PGN which broke its rate
    pub pgn: u32,
    /// Node which sent it
    pub source: u8,
    /// Longest gap allowed, including jitter tolerance
    pub allowed: Duration,
    /// Gap observed
    pub observed: Duration,
    /// Arrival time of the packet which ended the gap
    pub at: Duration,
}

/// Checks broadcast timing against the rates in a [ParameterCatalog]
#[derive(Debug, Clone, Copy)]
pub struct BroadcastValidator<'a> {
    catalog: &'a ParameterCatalog,
    jitter_tolerance: f64,
}

impl<'a> BroadcastValidator<'a> {
    /// Creates a validator using [DEFAULT_JITTER_TOLERANCE]
    pub fn new(catalog: &'a ParameterCatalog) -> Self {
        Self {
            catalog,
            jitter_tolerance: DEFAULT_JITTER_TOLERANCE,
        }
    }

    /// Sets the jitter tolerance factor. Values below 1.0 are raised to 1.0.
    /// NaN and infinite factors are ignored
    pub fn with_jitter_tolerance(mut self, factor: f64) -> Self {
        if factor.is_finite() {
            self.jitter_tolerance = factor.max(1.0);
        } else {
            log::warn!(
                "Ignoring jitter tolerance {factor}, keeping {}",
                self.jitter_tolerance
            );
        }
        self
    }

    /// Jitter tolerance in use
    pub fn jitter_tolerance(&self) -> f64 {
        self.jitter_tolerance
    }

    /// Longest mandated interval of every periodic PGN in the catalog.
    /// Listening this long sees at least one cycle of every periodic broadcast
    pub fn maximum_broadcast_period(&self) -> Duration {
        self.maximum_broadcast_period_of(&self.catalog.periodic_pgns())
    }

    /// Longest mandated interval among `pgns`. Zero if none of them is periodic
    pub fn maximum_broadcast_period_of(&self, pgns: &[u32]) -> Duration {
        pgns.iter()
            .filter_map(|pgn| self.catalog.transmission_rate(*pgn))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Partitions the packets sent by `address` by PGN, keeping arrival order
    pub fn group_by_pgn_and_node(
        &self,
        packets: &[DecodedPacket],
        address: u8,
    ) -> BTreeMap<u32, Vec<DecodedPacket>> {
        let mut map: BTreeMap<u32, Vec<DecodedPacket>> = BTreeMap::new();
        for p in packets.iter().filter(|p| p.source() == address) {
            map.entry(p.pgn()).or_default().push(p.clone());
        }
        map
    }

    /// Builds the observation of every group in `map`
    pub fn observations(&self, map: &BTreeMap<u32, Vec<DecodedPacket>>) -> Vec<BroadcastObservation> {
        map.iter()
            .filter_map(|(pgn, packets)| {
                let source = packets.first()?.source();
                let state = packets
                    .iter()
                    .fold(ObservationState::NeverSeen, |s, _| s.observe());
                Some(BroadcastObservation {
                    pgn: *pgn,
                    source,
                    timestamps: packets.iter().map(DecodedPacket::timestamp).collect(),
                    state,
                })
            })
            .collect()
    }

    /// Longest gap allowed for `pgn`, if it has a mandated rate
    pub fn allowed_gap(&self, pgn: u32) -> Option<Duration> {
        self.catalog
            .transmission_rate(pgn)
            .map(|rate| {
                Duration::try_from_secs_f64(rate.as_secs_f64() * self.jitter_tolerance).unwrap_or(Duration::MAX)
            })
    }

    /// Checks every group with at least two packets and reports each gap longer
    /// than the PGN's rate (times the jitter tolerance) as a failure of step
    /// `part`.`step`. Groups with a single packet, and PGNs without a mandated
    /// rate, produce no verdict
    pub fn report_period(
        &self,
        map: &BTreeMap<u32, Vec<DecodedPacket>>,
        address: u8,
        listener: &mut dyn ResultsListener,
        part: u8,
        step: u8,
    ) -> Vec<PeriodViolation> {
        let mut violations = Vec::new();
        for observation in self.observations(map) {
            if observation.state != ObservationState::PeriodMeasurable {
                continue;
            }
            let Some(allowed) = self.allowed_gap(observation.pgn) else {
                log::debug!("PGN {} has no mandated rate, skipping period check", observation.pgn);
                continue;
            };
            for (i, delta) in observation.deltas().into_iter().enumerate() {
                if delta <= allowed {
                    continue;
                }
                let message = format!(
                    "6.{part}.{step} - Broadcast period of PGN {} ({}) from {} exceeded maximum allowed of {} ms: observed {} ms",
                    observation.pgn,
                    self.catalog.label(observation.pgn),
                    module_label(address),
                    allowed.as_millis(),
                    delta.as_millis()
                );
                log::warn!("{message}");
                listener.add_outcome(part, step, Outcome::Fail, &message);
                violations.push(PeriodViolation {
                    pgn: observation.pgn,
                    source: address,
                    allowed,
                    observed: delta,
                    at: observation.timestamps[i + 1],
                });
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::J1939Id, listener::RecordingListener, packet::RawPacket};

    fn packet(pgn: u32, source: u8, ms: u64) -> DecodedPacket {
        DecodedPacket {
            packet: RawPacket::new(J1939Id::new(6, pgn, None, source), &[0xFF; 8], Duration::from_millis(ms)),
            values: Vec::new(),
        }
    }

    #[test]
    fn maximum_period_uses_slowest_rate() {
        let catalog = ParameterCatalog::builtin();
        let validator = BroadcastValidator::new(&catalog);
        // WFI is only sent every 10s
        assert_eq!(validator.maximum_broadcast_period(), Duration::from_secs(10));
        assert_eq!(
            validator.maximum_broadcast_period_of(&[61444, 65262, 65259]),
            Duration::from_secs(1)
        );
        assert_eq!(validator.maximum_broadcast_period_of(&[65259]), Duration::ZERO);
    }

    #[test]
    fn late_broadcast_fails() {
        let catalog = ParameterCatalog::builtin();
        let validator = BroadcastValidator::new(&catalog);
        let packets = vec![packet(65262, 0x00, 0), packet(65262, 0x00, 3100)];
        let map = validator.group_by_pgn_and_node(&packets, 0x00);

        let mut listener = RecordingListener::new();
        let violations = validator.report_period(&map, 0x00, &mut listener, 1, 13);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].observed, Duration::from_millis(3100));
        assert_eq!(violations[0].allowed, Duration::from_millis(1100));

        let fails = listener.outcomes_of(Outcome::Fail);
        assert_eq!(fails.len(), 1);
        assert_eq!(
            fails[0].message,
            "6.1.13 - Broadcast period of PGN 65262 (ET1 - Engine Temperature 1) from Engine #1 (0) exceeded maximum allowed of 1100 ms: observed 3100 ms"
        );
    }

    #[test]
    fn jitter_within_tolerance_passes() {
        let catalog = ParameterCatalog::builtin();
        let validator = BroadcastValidator::new(&catalog);
        let packets = vec![packet(65262, 0x00, 0), packet(65262, 0x00, 1090), packet(65262, 0x00, 2000)];
        let map = validator.group_by_pgn_and_node(&packets, 0x00);
        let mut listener = RecordingListener::new();
        assert!(validator.report_period(&map, 0x00, &mut listener, 1, 13).is_empty());
        assert!(listener.outcomes.is_empty());
    }

    #[test]
    fn unusable_jitter_factors() {
        let catalog = ParameterCatalog::builtin();
        let validator = BroadcastValidator::new(&catalog);
        assert_eq!(validator.with_jitter_tolerance(f64::INFINITY).jitter_tolerance(), DEFAULT_JITTER_TOLERANCE);
        assert_eq!(validator.with_jitter_tolerance(f64::NAN).jitter_tolerance(), DEFAULT_JITTER_TOLERANCE);
        assert_eq!(validator.with_jitter_tolerance(0.5).jitter_tolerance(), 1.0);

        // Too large for a Duration, saturates instead of panicking
        let huge = validator.with_jitter_tolerance(f64::MAX);
        assert_eq!(huge.allowed_gap(65262), Some(Duration::MAX));
        let packets = vec![packet(65262, 0x00, 0), packet(65262, 0x00, 60_000)];
        let map = huge.group_by_pgn_and_node(&packets, 0x00);
        let mut listener = RecordingListener::new();
        assert!(huge.report_period(&map, 0x00, &mut listener, 1, 13).is_empty());
    }

    #[test]
    fn single_observation_gives_no_verdict() {
        let catalog = ParameterCatalog::builtin();
        let validator = BroadcastValidator::new(&catalog);
        let packets = vec![packet(65262, 0x00, 0)];
        let map = validator.group_by_pgn_and_node(&packets, 0x00);

        let obs = validator.observations(&map);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].state, ObservationState::SeenOnce);

        let mut listener = RecordingListener::new();
        assert!(validator.report_period(&map, 0x00, &mut listener, 1, 13).is_empty());
        assert!(listener.outcomes.is_empty());
    }

    #[test]
    fn grouping_keeps_arrival_order() {
        let catalog = ParameterCatalog::builtin();
        let validator = BroadcastValidator::new(&catalog);
        let packets = vec![
            packet(61444, 0x00, 0),
            packet(65262, 0x00, 5),
            packet(61444, 0x01, 7),
            packet(61444, 0x00, 20),
            packet(65262, 0x00, 1005),
            packet(61444, 0x00, 40),
        ];
        let map = validator.group_by_pgn_and_node(&packets, 0x00);
        assert_eq!(map.len(), 2);

        let flattened: Vec<&DecodedPacket> = map.values().flatten().collect();
        assert_eq!(flattened.len(), 5);
        for group in map.values() {
            let positions: Vec<usize> = group
                .iter()
                .map(|p| packets.iter().position(|q| q == p).unwrap())
                .collect();
            assert!(positions.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(map[&61444][2].timestamp(), Duration::from_millis(40));
    }

    #[test]
    fn state_machine() {
        let s = ObservationState::NeverSeen;
        assert_eq!(s.observe(), ObservationState::SeenOnce);
        assert_eq!(s.observe().observe(), ObservationState::PeriodMeasurable);
        assert_eq!(s.observe().observe().observe(), ObservationState::PeriodMeasurable);
        assert_eq!(ObservationState::PeriodMeasurable.to_string(), "PERIOD_MEASURABLE");
    }
}
