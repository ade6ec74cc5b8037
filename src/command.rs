//! Typed commands and the cross-cutting command context.
//!
//! A command is a frozen value naming its target aggregate, the actor and
//! organizational context, correlation, and a domain payload. Commands
//! carry no event-level metadata: no event id, no aggregate version. The
//! handler stamps those at append time.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::domain::{
    AllergyCommand, AppointmentCommand, DiagnosisCommand, DuplicateCommand, EncounterCommand,
    ExaminationFindingCommand, LabResultCommand, NoteCommand, PatientCommand, ProcedureCommand,
    ReferralCommand, SymptomCommand, TreatmentPlanCommand, VitalSignsCommand,
};
use crate::envelope::{AggregateKind, Audience, ConnectionStatus, PerformerRole};

/// Cross-cutting metadata passed alongside every command.
///
/// Mapped onto event metadata when events are appended. Built with the
/// `with_*` chain; only actor and organizational identity are mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the actor issuing the command.
    pub performed_by: Uuid,
    /// Role of the actor at decision time.
    pub performer_role: PerformerRole,
    /// Owning organization.
    pub organization_id: Uuid,
    /// Facility within the organization.
    pub facility_id: Uuid,
    /// Device the command originates from.
    pub device_id: String,
    /// Connectivity the device reports for itself.
    pub connection_status: ConnectionStatus,
    /// Correlates all events of one request. Minted by the handler when
    /// absent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<Uuid>,
    /// The event that caused this command, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<Uuid>,
    /// Audience tags for the produced events; defaults to clinical staff.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub visibility: Option<BTreeSet<Audience>>,
    /// Optional deadline honored between handler retries.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deadline: Option<DateTime<FixedOffset>>,
}

impl CommandContext {
    pub fn new(
        performed_by: Uuid,
        performer_role: PerformerRole,
        organization_id: Uuid,
        facility_id: Uuid,
        device_id: impl Into<String>,
        connection_status: ConnectionStatus,
    ) -> Self {
        Self {
            performed_by,
            performer_role,
            organization_id,
            facility_id,
            device_id: device_id.into(),
            connection_status,
            correlation_id: None,
            causation_id: None,
            visibility: None,
            deadline: None,
        }
    }

    /// Set the correlation id instead of letting the handler mint one.
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Record the event that caused this command.
    pub fn with_causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Override the audience tags of the produced events.
    pub fn with_visibility(mut self, visibility: BTreeSet<Audience>) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// Set a deadline honored between handler retries.
    pub fn with_deadline(mut self, deadline: DateTime<FixedOffset>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Every command the core accepts, routed by aggregate kind.
///
/// One variant per aggregate family; the inner enums carry the domain
/// payloads. Exhaustive matches over this type are how the core guarantees
/// each command maps to exactly one aggregate kind and one event kind.
#[derive(Debug, Clone)]
pub enum ClinicalCommand {
    Patient { patient_id: Uuid, command: PatientCommand },
    Encounter { encounter_id: Uuid, command: EncounterCommand },
    Diagnosis { diagnosis_id: Uuid, command: DiagnosisCommand },
    Note { note_id: Uuid, command: NoteCommand },
    Appointment { appointment_id: Uuid, command: AppointmentCommand },
    Allergy { allergy_id: Uuid, command: AllergyCommand },
    Duplicate { resolution_id: Uuid, command: DuplicateCommand },
    VitalSigns { observation_id: Uuid, command: VitalSignsCommand },
    Symptom { observation_id: Uuid, command: SymptomCommand },
    ExaminationFinding { observation_id: Uuid, command: ExaminationFindingCommand },
    LabResult { observation_id: Uuid, command: LabResultCommand },
    Procedure { record_id: Uuid, command: ProcedureCommand },
    Referral { record_id: Uuid, command: ReferralCommand },
    TreatmentPlan { record_id: Uuid, command: TreatmentPlanCommand },
}

impl ClinicalCommand {
    /// The target aggregate kind.
    pub fn aggregate_kind(&self) -> AggregateKind {
        match self {
            Self::Patient { .. } => AggregateKind::PatientRegistration,
            Self::Encounter { .. } => AggregateKind::Encounter,
            Self::Diagnosis { .. } => AggregateKind::Diagnosis,
            Self::Note { .. } => AggregateKind::ClinicalNote,
            Self::Appointment { .. } => AggregateKind::Appointment,
            Self::Allergy { .. } => AggregateKind::AllergyRecord,
            Self::Duplicate { .. } => AggregateKind::DuplicateResolution,
            Self::VitalSigns { .. } => AggregateKind::VitalSigns,
            Self::Symptom { .. } => AggregateKind::Symptom,
            Self::ExaminationFinding { .. } => AggregateKind::ExaminationFinding,
            Self::LabResult { .. } => AggregateKind::LabResult,
            Self::Procedure { .. } => AggregateKind::Procedure,
            Self::Referral { .. } => AggregateKind::Referral,
            Self::TreatmentPlan { .. } => AggregateKind::TreatmentPlan,
        }
    }

    /// The target aggregate id.
    pub fn aggregate_id(&self) -> Uuid {
        match self {
            Self::Patient { patient_id, .. } => *patient_id,
            Self::Encounter { encounter_id, .. } => *encounter_id,
            Self::Diagnosis { diagnosis_id, .. } => *diagnosis_id,
            Self::Note { note_id, .. } => *note_id,
            Self::Appointment { appointment_id, .. } => *appointment_id,
            Self::Allergy { allergy_id, .. } => *allergy_id,
            Self::Duplicate { resolution_id, .. } => *resolution_id,
            Self::VitalSigns { observation_id, .. }
            | Self::Symptom { observation_id, .. }
            | Self::ExaminationFinding { observation_id, .. }
            | Self::LabResult { observation_id, .. } => *observation_id,
            Self::Procedure { record_id, .. }
            | Self::Referral { record_id, .. }
            | Self::TreatmentPlan { record_id, .. } => *record_id,
        }
    }

    /// The canonical wire name of this command.
    pub fn command_type(&self) -> &'static str {
        match self {
            Self::Patient { command, .. } => match command {
                PatientCommand::Register { .. } => "RegisterPatient",
                PatientCommand::CorrectIdentity { .. } => "CorrectPatientIdentity",
                PatientCommand::DeclareContactInfo { .. } => "DeclareContactInfo",
                PatientCommand::RecordDeceased { .. } => "RecordPatientDeceased",
                PatientCommand::TransferOut { .. } => "TransferPatientOut",
            },
            Self::Encounter { command, .. } => match command {
                EncounterCommand::CheckIn { .. } => "CheckInPatient",
                EncounterCommand::Triage { .. } => "TriagePatient",
                EncounterCommand::Begin { .. } => "BeginEncounter",
                EncounterCommand::Complete { .. } => "CompleteEncounter",
                EncounterCommand::Reopen { .. } => "ReopenEncounter",
                EncounterCommand::Discharge { .. } => "DischargePatient",
            },
            Self::Diagnosis { command, .. } => match command {
                DiagnosisCommand::Make { .. } => "MakeDiagnosis",
                DiagnosisCommand::Revise { .. } => "ReviseDiagnosis",
                DiagnosisCommand::Resolve { .. } => "ResolveDiagnosis",
            },
            Self::Note { command, .. } => match command {
                NoteCommand::Author { .. } => "AuthorClinicalNote",
                NoteCommand::AppendAddendum { .. } => "AppendNoteAddendum",
                NoteCommand::Cosign { .. } => "CosignClinicalNote",
            },
            Self::Appointment { command, .. } => match command {
                AppointmentCommand::Request { .. } => "RequestAppointment",
                AppointmentCommand::Confirm { .. } => "ConfirmAppointment",
                AppointmentCommand::Reschedule { .. } => "RescheduleAppointment",
                AppointmentCommand::CancelByPatient { .. } => "CancelAppointmentByPatient",
                AppointmentCommand::CancelByPractice { .. } => "CancelAppointmentByPractice",
                AppointmentCommand::MarkNoShow { .. } => "MarkAppointmentNoShow",
            },
            Self::Allergy { command, .. } => match command {
                AllergyCommand::Identify { .. } => "IdentifyAllergy",
                AllergyCommand::Refute { .. } => "RefuteAllergy",
            },
            Self::Duplicate { command, .. } => match command {
                DuplicateCommand::Flag { .. } => "FlagDuplicatePatients",
                DuplicateCommand::Resolve { .. } => "ResolveDuplicatePatients",
            },
            Self::VitalSigns { .. } => "RecordVitalSigns",
            Self::Symptom { .. } => "ReportSymptom",
            Self::ExaminationFinding { .. } => "RecordExaminationFinding",
            Self::LabResult { .. } => "RecordLabResult",
            Self::Procedure { .. } => "RecordProcedure",
            Self::Referral { .. } => "IssueReferral",
            Self::TreatmentPlan { .. } => "EstablishTreatmentPlan",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn at() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-03-01T08:55:00+00:00").expect("valid rfc3339")
    }

    #[test]
    fn context_builder_chains() {
        let correlation = Uuid::new_v4();
        let ctx = CommandContext::new(
            Uuid::new_v4(),
            PerformerRole::Physician,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "tablet-3",
            ConnectionStatus::Offline,
        )
        .with_correlation_id(correlation)
        .with_deadline(at());
        assert_eq!(ctx.correlation_id, Some(correlation));
        assert_eq!(ctx.deadline, Some(at()));
        assert_eq!(ctx.device_id, "tablet-3");
    }

    #[test]
    fn command_routes_to_its_aggregate() {
        let encounter_id = Uuid::new_v4();
        let cmd = ClinicalCommand::Encounter {
            encounter_id,
            command: EncounterCommand::Begin { occurred_at: at() },
        };
        assert_eq!(cmd.aggregate_kind(), AggregateKind::Encounter);
        assert_eq!(cmd.aggregate_id(), encounter_id);
        assert_eq!(cmd.command_type(), "BeginEncounter");
    }

    #[test]
    fn fact_commands_have_canonical_names() {
        let cmd = ClinicalCommand::VitalSigns {
            observation_id: Uuid::new_v4(),
            command: VitalSignsCommand::Record {
                patient_id: Uuid::new_v4(),
                encounter_id: Uuid::new_v4(),
                systolic_mmhg: 120,
                diastolic_mmhg: 80,
                heart_rate_bpm: 70,
                temperature_dc: 370,
                respiratory_rate: 14,
                occurred_at: at(),
            },
        };
        assert_eq!(cmd.command_type(), "RecordVitalSigns");
        assert!(cmd.aggregate_kind().is_fact());
    }
}
