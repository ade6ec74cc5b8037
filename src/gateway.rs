//! Command gateway: the single entry point for untrusted request records.
//!
//! The gateway validates input shape only, maps the request to a typed
//! command via the registry below, and reports every outcome as a value.
//! It never throws, never produces events, never runs domain logic, and
//! never reads projections for business answers.

use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::aggregate::DomainError;
use crate::command::{ClinicalCommand, CommandContext};
use crate::envelope::EventEnvelope;
use crate::handler::{CommandError, TransientSource};
use crate::invariant::InvariantCode;

/// Maximum accepted length of any string field in a payload.
const MAX_STRING_FIELD_LEN: usize = 4096;

/// Maximum accepted serialized payload size.
const MAX_PAYLOAD_BYTES: usize = 16 * 1024;

/// An untrusted request record, as any transport delivers it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommandRequest {
    pub command_type: String,
    pub payload: serde_json::Value,
}

/// Everything a command submission can come back with.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Success { events: Vec<EventEnvelope> },
    ValidationError { field: String, reason: String },
    UnknownCommandType { command_type: String },
    PreconditionFailed { code: InvariantCode },
    DomainError { code: InvariantCode, detail: String },
    ConcurrencyError { retries: u32 },
    Transient { source: String },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The wire shape: `{success, events?, error?: {kind, detail}}`.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Self::Success { events } => serde_json::json!({
                "success": true,
                "events": events,
            }),
            Self::ValidationError { field, reason } => wire_error(
                "validation_error",
                &format!("{field}: {reason}"),
            ),
            Self::UnknownCommandType { command_type } => wire_error(
                "unknown_command_type",
                command_type,
            ),
            Self::PreconditionFailed { code } => wire_error("precondition_failed", code.as_str()),
            Self::DomainError { code, detail } => wire_error(
                "domain_error",
                &format!("{code}: {detail}"),
            ),
            Self::ConcurrencyError { retries } => wire_error(
                "concurrency_error",
                &format!("retries exhausted after {retries} attempts"),
            ),
            Self::Transient { source } => wire_error("transient", source),
        }
    }
}

fn wire_error(kind: &str, detail: &str) -> serde_json::Value {
    serde_json::json!({
        "success": false,
        "error": { "kind": kind, "detail": detail },
    })
}

/// Translate a handler failure into the outcome taxonomy.
pub fn outcome_from_error(error: CommandError) -> CommandOutcome {
    match error {
        CommandError::Precondition { code } => CommandOutcome::PreconditionFailed { code },
        CommandError::Domain(DomainError { code, detail }) => {
            CommandOutcome::DomainError { code, detail }
        }
        CommandError::Concurrency { retries } => CommandOutcome::ConcurrencyError { retries },
        CommandError::Transient(TransientSource::Deadline) => CommandOutcome::Transient {
            source: "deadline".to_string(),
        },
        CommandError::Transient(TransientSource::Storage(message)) => {
            CommandOutcome::Transient { source: message }
        }
    }
}

/// Context fields every payload must carry.
const CONTEXT_FIELDS: [&str; 6] = [
    "performed_by",
    "performer_role",
    "organization_id",
    "facility_id",
    "device_id",
    "connection_status",
];

/// The command registry: wire name, aggregate id field, family tag.
///
/// One row per command type; the canonical list of accepted commands.
const REGISTRY: [(&str, &str, &str); 34] = [
    ("RegisterPatient", "patient_id", "Register"),
    ("CorrectPatientIdentity", "patient_id", "CorrectIdentity"),
    ("DeclareContactInfo", "patient_id", "DeclareContactInfo"),
    ("RecordPatientDeceased", "patient_id", "RecordDeceased"),
    ("TransferPatientOut", "patient_id", "TransferOut"),
    ("CheckInPatient", "encounter_id", "CheckIn"),
    ("TriagePatient", "encounter_id", "Triage"),
    ("BeginEncounter", "encounter_id", "Begin"),
    ("CompleteEncounter", "encounter_id", "Complete"),
    ("ReopenEncounter", "encounter_id", "Reopen"),
    ("DischargePatient", "encounter_id", "Discharge"),
    ("MakeDiagnosis", "diagnosis_id", "Make"),
    ("ReviseDiagnosis", "diagnosis_id", "Revise"),
    ("ResolveDiagnosis", "diagnosis_id", "Resolve"),
    ("AuthorClinicalNote", "note_id", "Author"),
    ("AppendNoteAddendum", "note_id", "AppendAddendum"),
    ("CosignClinicalNote", "note_id", "Cosign"),
    ("RequestAppointment", "appointment_id", "Request"),
    ("ConfirmAppointment", "appointment_id", "Confirm"),
    ("RescheduleAppointment", "appointment_id", "Reschedule"),
    ("CancelAppointmentByPatient", "appointment_id", "CancelByPatient"),
    ("CancelAppointmentByPractice", "appointment_id", "CancelByPractice"),
    ("MarkAppointmentNoShow", "appointment_id", "MarkNoShow"),
    ("IdentifyAllergy", "allergy_id", "Identify"),
    ("RefuteAllergy", "allergy_id", "Refute"),
    ("FlagDuplicatePatients", "resolution_id", "Flag"),
    ("ResolveDuplicatePatients", "resolution_id", "Resolve"),
    ("RecordVitalSigns", "observation_id", "Record"),
    ("ReportSymptom", "observation_id", "Report"),
    ("RecordExaminationFinding", "observation_id", "Record"),
    ("RecordLabResult", "observation_id", "Record"),
    ("RecordProcedure", "record_id", "Record"),
    ("IssueReferral", "record_id", "Issue"),
    ("EstablishTreatmentPlan", "record_id", "Establish"),
];

/// Validate shape and map an untrusted request to a typed command.
///
/// Returns the failed outcome directly so callers can pass it through
/// unchanged; this function performs no I/O and runs no business rules.
pub fn map_request(
    request: &CommandRequest,
) -> Result<(ClinicalCommand, CommandContext), CommandOutcome> {
    let payload = request.payload.as_object().ok_or_else(|| {
        CommandOutcome::ValidationError {
            field: "payload".to_string(),
            reason: "payload must be an object".to_string(),
        }
    })?;

    let serialized_len = request.payload.to_string().len();
    if serialized_len > MAX_PAYLOAD_BYTES {
        return Err(CommandOutcome::ValidationError {
            field: "payload".to_string(),
            reason: format!("payload exceeds {MAX_PAYLOAD_BYTES} bytes"),
        });
    }
    for (field, value) in payload {
        if let Some(text) = value.as_str()
            && text.len() > MAX_STRING_FIELD_LEN
        {
            return Err(CommandOutcome::ValidationError {
                field: field.clone(),
                reason: format!("string exceeds {MAX_STRING_FIELD_LEN} characters"),
            });
        }
    }

    for field in CONTEXT_FIELDS {
        if !payload.contains_key(field) {
            return Err(CommandOutcome::ValidationError {
                field: field.to_string(),
                reason: "missing required field".to_string(),
            });
        }
    }
    let ctx: CommandContext =
        serde_json::from_value(request.payload.clone()).map_err(|e| {
            CommandOutcome::ValidationError {
                field: "payload".to_string(),
                reason: e.to_string(),
            }
        })?;

    let Some(&(_, id_field, tag)) = REGISTRY
        .iter()
        .find(|(name, _, _)| *name == request.command_type)
    else {
        return Err(CommandOutcome::UnknownCommandType {
            command_type: request.command_type.clone(),
        });
    };

    let aggregate_id = payload
        .get(id_field)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| CommandOutcome::ValidationError {
            field: id_field.to_string(),
            reason: "missing or invalid UUID".to_string(),
        })?;

    let command = build_command(&request.command_type, aggregate_id, tag, &request.payload)?;
    Ok((command, ctx))
}

/// Parse an adjacently tagged family command from the flat payload.
fn parse_family<C: DeserializeOwned>(
    tag: &str,
    payload: &serde_json::Value,
) -> Result<C, CommandOutcome> {
    let tagged = serde_json::json!({ "type": tag, "data": payload });
    serde_json::from_value(tagged).map_err(|e| CommandOutcome::ValidationError {
        field: "payload".to_string(),
        reason: e.to_string(),
    })
}

fn build_command(
    command_type: &str,
    id: Uuid,
    tag: &str,
    payload: &serde_json::Value,
) -> Result<ClinicalCommand, CommandOutcome> {
    let command = match command_type {
        "RegisterPatient" | "CorrectPatientIdentity" | "DeclareContactInfo"
        | "RecordPatientDeceased" | "TransferPatientOut" => ClinicalCommand::Patient {
            patient_id: id,
            command: parse_family(tag, payload)?,
        },
        "CheckInPatient" | "TriagePatient" | "BeginEncounter" | "CompleteEncounter"
        | "ReopenEncounter" | "DischargePatient" => ClinicalCommand::Encounter {
            encounter_id: id,
            command: parse_family(tag, payload)?,
        },
        "MakeDiagnosis" | "ReviseDiagnosis" | "ResolveDiagnosis" => ClinicalCommand::Diagnosis {
            diagnosis_id: id,
            command: parse_family(tag, payload)?,
        },
        "AuthorClinicalNote" | "AppendNoteAddendum" | "CosignClinicalNote" => {
            ClinicalCommand::Note {
                note_id: id,
                command: parse_family(tag, payload)?,
            }
        }
        "RequestAppointment" | "ConfirmAppointment" | "RescheduleAppointment"
        | "CancelAppointmentByPatient" | "CancelAppointmentByPractice"
        | "MarkAppointmentNoShow" => ClinicalCommand::Appointment {
            appointment_id: id,
            command: parse_family(tag, payload)?,
        },
        "IdentifyAllergy" | "RefuteAllergy" => ClinicalCommand::Allergy {
            allergy_id: id,
            command: parse_family(tag, payload)?,
        },
        "FlagDuplicatePatients" | "ResolveDuplicatePatients" => ClinicalCommand::Duplicate {
            resolution_id: id,
            command: parse_family(tag, payload)?,
        },
        "RecordVitalSigns" => ClinicalCommand::VitalSigns {
            observation_id: id,
            command: parse_family(tag, payload)?,
        },
        "ReportSymptom" => ClinicalCommand::Symptom {
            observation_id: id,
            command: parse_family(tag, payload)?,
        },
        "RecordExaminationFinding" => ClinicalCommand::ExaminationFinding {
            observation_id: id,
            command: parse_family(tag, payload)?,
        },
        "RecordLabResult" => ClinicalCommand::LabResult {
            observation_id: id,
            command: parse_family(tag, payload)?,
        },
        "RecordProcedure" => ClinicalCommand::Procedure {
            record_id: id,
            command: parse_family(tag, payload)?,
        },
        "IssueReferral" => ClinicalCommand::Referral {
            record_id: id,
            command: parse_family(tag, payload)?,
        },
        "EstablishTreatmentPlan" => ClinicalCommand::TreatmentPlan {
            record_id: id,
            command: parse_family(tag, payload)?,
        },
        other => {
            return Err(CommandOutcome::UnknownCommandType {
                command_type: other.to_string(),
            });
        }
    };
    Ok(command)
}
