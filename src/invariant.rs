//! Stable invariant identifiers carried in domain errors and compensation
//! review items.
//!
//! Every rejection or eventual-consistency violation names exactly one code.
//! Callers use the code for localization and audit; the code strings are
//! part of the wire contract and never change meaning.

use serde::{Deserialize, Serialize};

/// Identifier of a clinical invariant.
///
/// Families: `PL` patient lifecycle, `EP` encounter progression, `CO`
/// clinical observations, `CJ` clinical judgment, `CD` clinical
/// documentation, `CA` care appointments, `XX` cross-cutting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvariantCode {
    /// Patient is already registered.
    #[serde(rename = "INV-PL-1")]
    PL1,
    /// Clinical activity targets a deceased or transferred-out patient.
    #[serde(rename = "INV-PL-2")]
    PL2,
    /// Lifecycle operation requires an active registration.
    #[serde(rename = "INV-PL-3")]
    PL3,
    /// Referenced patient is not registered.
    #[serde(rename = "INV-PL-4")]
    PL4,
    /// Terminal transition is only valid from the Active state.
    #[serde(rename = "INV-PL-5")]
    PL5,
    /// Encounter transition not permitted from the current state.
    #[serde(rename = "INV-EP-1")]
    EP1,
    /// Encounter does not exist.
    #[serde(rename = "INV-EP-2")]
    EP2,
    /// Concurrent active encounters for the same patient and practitioner.
    #[serde(rename = "INV-EP-3")]
    EP3,
    /// Observation requires an active encounter.
    #[serde(rename = "INV-CO-1")]
    CO1,
    /// Observation or diagnosis recorded after the encounter closed.
    #[serde(rename = "INV-CO-2")]
    CO2,
    /// Fact aggregate already holds its single event.
    #[serde(rename = "INV-CO-3")]
    CO3,
    /// Diagnosis requires an active encounter.
    #[serde(rename = "INV-CJ-1")]
    CJ1,
    /// Diagnosis does not exist.
    #[serde(rename = "INV-CJ-2")]
    CJ2,
    /// Resolved diagnosis cannot be revised.
    #[serde(rename = "INV-CJ-3")]
    CJ3,
    /// Diagnosis lifecycle operation repeated: already made or resolved.
    #[serde(rename = "INV-CJ-4")]
    CJ4,
    /// Treatment plan references a resolved diagnosis.
    #[serde(rename = "INV-CJ-5")]
    CJ5,
    /// Note lifecycle out of order: not yet authored, or authored twice.
    #[serde(rename = "INV-CD-1")]
    CD1,
    /// Note is already cosigned.
    #[serde(rename = "INV-CD-2")]
    CD2,
    /// Cosigner must differ from the original author.
    #[serde(rename = "INV-CD-3")]
    CD3,
    /// Administrative record transition not permitted from the current
    /// state (appointment, allergy record, duplicate resolution).
    #[serde(rename = "INV-CA-1")]
    CA1,
    /// Administrative record is in a terminal state.
    #[serde(rename = "INV-CA-2")]
    CA2,
    /// Reschedule requires a confirmed appointment.
    #[serde(rename = "INV-CA-3")]
    CA3,
    /// Administrative record does not exist.
    #[serde(rename = "INV-CA-4")]
    CA4,
    /// `occurred_at` lies more than five minutes in the future.
    #[serde(rename = "INV-XX-1")]
    XX1,
    /// Device local sequence number is not strictly increasing.
    #[serde(rename = "INV-XX-2")]
    XX2,
    /// Aggregate version does not continue the stream.
    #[serde(rename = "INV-XX-3")]
    XX3,
}

impl InvariantCode {
    /// The stable wire identifier, e.g. `"INV-CJ-3"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PL1 => "INV-PL-1",
            Self::PL2 => "INV-PL-2",
            Self::PL3 => "INV-PL-3",
            Self::PL4 => "INV-PL-4",
            Self::PL5 => "INV-PL-5",
            Self::EP1 => "INV-EP-1",
            Self::EP2 => "INV-EP-2",
            Self::EP3 => "INV-EP-3",
            Self::CO1 => "INV-CO-1",
            Self::CO2 => "INV-CO-2",
            Self::CO3 => "INV-CO-3",
            Self::CJ1 => "INV-CJ-1",
            Self::CJ2 => "INV-CJ-2",
            Self::CJ3 => "INV-CJ-3",
            Self::CJ4 => "INV-CJ-4",
            Self::CJ5 => "INV-CJ-5",
            Self::CD1 => "INV-CD-1",
            Self::CD2 => "INV-CD-2",
            Self::CD3 => "INV-CD-3",
            Self::CA1 => "INV-CA-1",
            Self::CA2 => "INV-CA-2",
            Self::CA3 => "INV-CA-3",
            Self::CA4 => "INV-CA-4",
            Self::XX1 => "INV-XX-1",
            Self::XX2 => "INV-XX-2",
            Self::XX3 => "INV-XX-3",
        }
    }
}

impl std::fmt::Display for InvariantCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
