//! Immutable event envelope and its mandatory metadata.
//!
//! Every clinical fact is recorded as an [`EventEnvelope`]: seventeen
//! mandatory metadata fields plus an opaque JSON payload. Envelopes are
//! never mutated after creation; the handful of fields the pipeline stamps
//! after `decide` (version, recording time, sync batch) are set through
//! copy-on-write helpers that return a fresh envelope.

use std::collections::BTreeSet;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether the producing device believed itself connected at decision time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

/// Role of the actor that performed a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformerRole {
    Physician,
    NursePractitioner,
    RegisteredNurse,
    MedicalAssistant,
    FrontDesk,
    LabTechnician,
    Administrator,
    /// Reserved for hub-emitted compensating events.
    System,
}

/// Audience tags controlling which consumers may see an event.
///
/// The full tag set is enumerated here and nowhere else;
/// `Part2Restricted` covers 42 CFR Part 2 material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    ClinicalStaff,
    Billing,
    PatientPortal,
    Part2Restricted,
}

/// The default audience for clinical events.
pub fn default_visibility() -> BTreeSet<Audience> {
    BTreeSet::from([Audience::ClinicalStaff])
}

/// The fourteen aggregate kinds plus the hub-side compensation review
/// stream. Wire names are lowercase snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    PatientRegistration,
    Encounter,
    Diagnosis,
    ClinicalNote,
    Appointment,
    AllergyRecord,
    DuplicateResolution,
    VitalSigns,
    Symptom,
    ExaminationFinding,
    LabResult,
    Procedure,
    Referral,
    TreatmentPlan,
    CompensationReview,
}

impl AggregateKind {
    /// Fact aggregates hold exactly one event and never transition.
    pub fn is_fact(&self) -> bool {
        matches!(
            self,
            Self::VitalSigns
                | Self::Symptom
                | Self::ExaminationFinding
                | Self::LabResult
                | Self::Procedure
                | Self::Referral
                | Self::TreatmentPlan
        )
    }

    /// Lifecycle aggregates carry a finite state machine.
    pub fn is_lifecycle(&self) -> bool {
        !self.is_fact() && *self != Self::CompensationReview
    }

    /// Wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatientRegistration => "patient_registration",
            Self::Encounter => "encounter",
            Self::Diagnosis => "diagnosis",
            Self::ClinicalNote => "clinical_note",
            Self::Appointment => "appointment",
            Self::AllergyRecord => "allergy_record",
            Self::DuplicateResolution => "duplicate_resolution",
            Self::VitalSigns => "vital_signs",
            Self::Symptom => "symptom",
            Self::ExaminationFinding => "examination_finding",
            Self::LabResult => "lab_result",
            Self::Procedure => "procedure",
            Self::Referral => "referral",
            Self::TreatmentPlan => "treatment_plan",
            Self::CompensationReview => "compensation_review",
        }
    }
}

/// The mandatory metadata stamped on every event.
///
/// Identity, aggregate, temporal, actor, organizational, device, trace,
/// and access fields, in the order the serialized form lists them.
/// Unknown fields are tolerated on read; `schema_version` on the envelope
/// and inside payloads enables upcasting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Time-sortable unique event id (UUID v7).
    pub event_id: Uuid,
    /// Namespaced event type, e.g. `clinical.encounter.EncounterBegan`.
    pub event_type: String,
    /// Payload schema version.
    pub schema_version: u32,
    /// Aggregate instance identity.
    pub aggregate_id: Uuid,
    /// Aggregate kind the stream belongs to.
    pub aggregate_type: AggregateKind,
    /// Position within the stream, starting at 1.
    pub aggregate_version: u64,
    /// Clinical time the fact occurred, as entered at the point of care.
    pub occurred_at: DateTime<FixedOffset>,
    /// Time the local store accepted the event.
    pub recorded_at: DateTime<FixedOffset>,
    /// Actor that issued the command.
    pub performed_by: Uuid,
    /// Role of the actor at decision time.
    pub performer_role: PerformerRole,
    /// Owning organization.
    pub organization_id: Uuid,
    /// Facility within the organization.
    pub facility_id: Uuid,
    /// Producing device.
    pub device_id: String,
    /// Connectivity the device reported when the event was produced.
    pub connection_status: ConnectionStatus,
    /// Estimated device clock drift against the hub, milliseconds.
    pub device_clock_drift_ms: i64,
    /// Per-device sequence number, strictly increasing from 1.
    pub local_sequence_number: u64,
    /// Batch the event travelled in, set during sync upload.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sync_batch_id: Option<Uuid>,
    /// Correlates all events of one request.
    pub correlation_id: Uuid,
    /// The event that caused this one, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<Uuid>,
    /// Audience tags.
    #[serde(default = "default_visibility")]
    pub visibility: BTreeSet<Audience>,
}

/// An immutable clinical event: metadata envelope plus domain payload.
///
/// The payload is unstructured JSON; event schemas are defined per event
/// type and versioned through `schema_version`. The store does not
/// interpret payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub metadata: EventMetadata,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn event_id(&self) -> Uuid {
        self.metadata.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.metadata.event_type
    }

    pub fn aggregate_id(&self) -> Uuid {
        self.metadata.aggregate_id
    }

    pub fn aggregate_type(&self) -> AggregateKind {
        self.metadata.aggregate_type
    }

    pub fn aggregate_version(&self) -> u64 {
        self.metadata.aggregate_version
    }

    pub fn occurred_at(&self) -> DateTime<FixedOffset> {
        self.metadata.occurred_at
    }

    pub fn recorded_at(&self) -> DateTime<FixedOffset> {
        self.metadata.recorded_at
    }

    /// `occurred_at` corrected by the producing device's estimated drift.
    /// This is the rule-4 key of the causal order.
    pub fn adjusted_occurred_at(&self) -> DateTime<FixedOffset> {
        self.metadata.occurred_at - chrono::Duration::milliseconds(self.metadata.device_clock_drift_ms)
    }

    /// Extract a UUID field from the payload, e.g. `patient_id`.
    pub fn payload_uuid(&self, field: &str) -> Option<Uuid> {
        self.payload
            .get(field)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Copy with `recorded_at` replaced. Used by the handler at stamp time.
    pub fn with_recorded_at(&self, at: DateTime<FixedOffset>) -> Self {
        let mut copy = self.clone();
        copy.metadata.recorded_at = at;
        copy
    }

    /// Copy with `aggregate_version` replaced. Used by the handler on
    /// retry and by conflict resolution when renumbering.
    pub fn with_aggregate_version(&self, version: u64) -> Self {
        let mut copy = self.clone();
        copy.metadata.aggregate_version = version;
        copy
    }

    /// Copy with the sync batch id set. Used by the device upload path.
    pub fn with_sync_batch_id(&self, batch: Uuid) -> Self {
        let mut copy = self.clone();
        copy.metadata.sync_batch_id = Some(batch);
        copy
    }
}
