//! Parameter catalog
//!
//! Static lookup between parameter groups (PGNs) and the diagnostic parameters (SPNs)
//! they carry, together with how each group is normally obtained: pushed periodically by
//! the sender, or only sent when requested.
//!
//! The catalog is built once and then only read. Lookups for unknown ids return empty
//! results rather than errors, as vehicle data it is queried with is frequently incomplete.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

mod builtin;

/// How a parameter group is normally put on the bus
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display, strum_macros::EnumString,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Classification {
    /// Sent unsolicited at a fixed rate
    #[strum(serialize = "PERIODIC_BROADCAST")]
    PeriodicBroadcast,
    /// Only sent in response to a request
    #[strum(serialize = "ON_REQUEST_ONLY")]
    OnRequestOnly,
}

/// Widest numeric parameter which can be decoded
pub const MAX_BIT_LENGTH: u8 = 32;

/// Where an SPN sits within its parameter group's payload
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SlotEncoding {
    /// Scaled integer. Bit positions count from bit 0 of byte 0
    Numeric {
        /// First bit of the parameter
        start_bit: u16,
        /// Length in bits, 1 to [MAX_BIT_LENGTH]
        bit_length: u8,
        /// Scaling per bit
        resolution: f64,
        /// Offset applied after scaling
        offset: f64,
    },
    /// `*` delimited ASCII field
    Ascii {
        /// Byte the delimited fields start at
        start_byte: u16,
        /// Index of the field
        field: u8,
    },
}

/// A diagnostic parameter within a parameter group
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpnSlot {
    /// Suspect parameter number
    pub spn: u32,
    /// Name of the parameter
    pub label: String,
    /// Position and scaling within the payload
    pub encoding: SlotEncoding,
}

/// Definition of a parameter group
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PgnDefinition {
    /// Parameter group number
    pub id: u32,
    /// Name of the group
    pub label: String,
    /// Short name of the group
    pub acronym: String,
    /// How the group is normally obtained
    pub classification: Classification,
    /// Mandated interval between broadcasts. Only set for periodic groups
    pub transmission_rate_ms: Option<u32>,
    /// Parameters carried, in payload order
    pub slots: Vec<SpnSlot>,
}

impl PgnDefinition {
    /// True if the group is sent unsolicited at a fixed rate
    pub fn is_periodic(&self) -> bool {
        self.classification == Classification::PeriodicBroadcast
    }

    /// SPNs carried by this group
    pub fn spns(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().map(|s| s.spn)
    }
}

/// Read-only PGN ⇄ SPN lookup
#[derive(Debug, Clone, Default)]
pub struct ParameterCatalog {
    pgns: BTreeMap<u32, PgnDefinition>,
    spn_index: BTreeMap<u32, BTreeSet<u32>>,
}

impl ParameterCatalog {
    /// Builds a catalog from a set of definitions. A later definition of
    /// the same PGN replaces an earlier one.
    ///
    /// Numeric slots which are empty or wider than 32 bits cannot be decoded and
    /// are dropped
    pub fn new<I: IntoIterator<Item = PgnDefinition>>(definitions: I) -> Self {
        let mut pgns = BTreeMap::new();
        for mut def in definitions {
            def.slots.retain(|slot| match slot.encoding {
                SlotEncoding::Numeric { bit_length, .. } if bit_length == 0 || bit_length > MAX_BIT_LENGTH => {
                    log::warn!(
                        "Dropping SPN {} of PGN {}: unsupported bit length {bit_length}",
                        slot.spn,
                        def.id
                    );
                    false
                }
                _ => true,
            });
            if pgns.insert(def.id, def).is_some() {
                log::warn!("Duplicate PGN definition in catalog, keeping the latest one");
            }
        }
        let mut spn_index: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for def in pgns.values() {
            for spn in def.spns() {
                spn_index.entry(spn).or_default().insert(def.id);
            }
        }
        log::debug!(
            "Parameter catalog loaded with {} PGNs and {} SPNs",
            pgns.len(),
            spn_index.len()
        );
        Self { pgns, spn_index }
    }

    /// The compiled in catalog of OBD relevant parameter groups
    pub fn builtin() -> Self {
        Self::new(builtin::definitions())
    }

    /// Loads a catalog from a JSON array of [PgnDefinition]
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let defs: Vec<PgnDefinition> = serde_json::from_str(json)?;
        Ok(Self::new(defs))
    }

    /// Returns the PGNs carrying any of `spns`, deduplicated and in ascending order.
    /// SPNs the catalog does not know contribute nothing
    pub fn pgns_for_spns<'s, I: IntoIterator<Item = &'s u32>>(&self, spns: I) -> BTreeSet<u32> {
        spns.into_iter()
            .filter_map(|spn| self.spn_index.get(spn))
            .flatten()
            .copied()
            .collect()
    }

    /// True if the PGN is known and normally broadcast periodically
    pub fn is_periodic_broadcast(&self, pgn: u32) -> bool {
        self.pgns.get(&pgn).is_some_and(PgnDefinition::is_periodic)
    }

    /// Mandated broadcast interval of a periodic PGN
    pub fn transmission_rate(&self, pgn: u32) -> Option<Duration> {
        self.pgns
            .get(&pgn)
            .filter(|d| d.is_periodic())
            .and_then(|d| d.transmission_rate_ms)
            .map(|ms| Duration::from_millis(ms as u64))
    }

    /// Looks up the definition of a PGN
    pub fn definition(&self, pgn: u32) -> Option<&PgnDefinition> {
        self.pgns.get(&pgn)
    }

    /// SPNs carried by a PGN. Empty for unknown PGNs
    pub fn spns_of(&self, pgn: u32) -> Vec<u32> {
        self.pgns
            .get(&pgn)
            .map(|d| d.spns().collect())
            .unwrap_or_default()
    }

    /// Human readable name of a PGN, as used in reports
    pub fn label(&self, pgn: u32) -> String {
        match self.pgns.get(&pgn) {
            Some(d) => format!("{} - {}", d.acronym, d.label),
            None => "Unknown".into(),
        }
    }

    /// Every periodic PGN, ascending
    pub fn periodic_pgns(&self) -> Vec<u32> {
        self.pgns
            .values()
            .filter(|d| d.is_periodic())
            .map(|d| d.id)
            .collect()
    }
}
