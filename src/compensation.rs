//! Eventual-consistency checks run on the hub for each uploaded event,
//! plus the review items they produce.
//!
//! The engine never modifies or rejects the triggering event: the event is
//! already accepted by its own stream's invariants. A violation produces a
//! `CompensationRequired` review event, and in exactly one unambiguous
//! case (an appointment kept alive for a terminal patient) also an
//! auto-compensating domain event.
//!
//! Violation table:
//!
//! | Violation | Auto-compensate? |
//! |---|---|
//! | Appointment requested/confirmed for terminal patient (`INV-PL-2`) | yes, `AppointmentCancelledByPractice` |
//! | Observation or diagnosis after encounter closed (`INV-CO-2`) | no |
//! | Diagnosis for terminal patient (`INV-PL-2`) | no |
//! | Treatment plan referencing resolved diagnosis (`INV-CJ-5`) | no |
//! | Concurrent active encounters, same patient + practitioner (`INV-EP-3`) | no |

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::device::DeviceSession;
use crate::envelope::{
    AggregateKind, ConnectionStatus, EventEnvelope, EventMetadata, PerformerRole,
    default_visibility,
};
use crate::invariant::InvariantCode;
use crate::readmodel::SharedReadModels;

/// Namespace for deriving deterministic compensation event ids (UUID v5).
///
/// The id of a review item is a pure function of the original event and
/// the violated invariant, so re-detecting the same violation on a sync
/// retry re-produces the same event and the append deduplicates it.
const COMPENSATION_NAMESPACE: Uuid = Uuid::from_bytes([
    0x4c, 0x2a, 0x90, 0x5e, 0x61, 0xd4, 0x41, 0xb7, 0x8f, 0x02, 0xe5, 0x3a, 0x1d, 0xc8, 0x77, 0x19,
]);

/// Event type of review items.
pub const COMPENSATION_EVENT_TYPE: &str = "clinical.sync.CompensationRequired";

/// Payload of a `CompensationRequired` review event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationPayload {
    pub original_event_id: Uuid,
    pub invariant_code: InvariantCode,
    /// What the producing device plausibly believed.
    pub stale_snapshot: serde_json::Value,
    /// What the hub knows now.
    pub current_snapshot: serde_json::Value,
    /// Present only for state-machine rejections during conflict
    /// resolution: the rejected envelope, verbatim.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_envelope: Option<Box<EventEnvelope>>,
}

/// One detected violation, before materialization as events.
#[derive(Debug, Clone)]
pub struct Violation {
    pub code: InvariantCode,
    pub stale_snapshot: serde_json::Value,
    pub current_snapshot: serde_json::Value,
    /// The appointment to auto-cancel, when the table says so.
    pub auto_cancel_appointment: Option<Uuid>,
}

/// Identity and context the hub stamps on the events it emits itself.
pub struct HubStamp<'a> {
    pub session: &'a DeviceSession,
    pub clock: &'a dyn Clock,
    pub organization_id: Uuid,
    pub facility_id: Uuid,
}

/// Detects eventual-consistency violations and builds the resulting
/// events.
#[derive(Debug, Default)]
pub struct CompensationEngine;

impl CompensationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Run the violation table against one accepted event.
    ///
    /// `models` must already reflect the accepted upload batch.
    pub fn check_event(&self, envelope: &EventEnvelope, models: &SharedReadModels) -> Vec<Violation> {
        let mut violations = Vec::new();
        let event_type = envelope.event_type();

        // Appointment kept alive for a terminal patient.
        if matches!(
            event_type,
            "clinical.scheduling.AppointmentRequested"
                | "clinical.scheduling.AppointmentConfirmed"
                | "clinical.scheduling.AppointmentRescheduled"
        ) {
            let appointment_id = envelope.aggregate_id();
            let patient = envelope
                .payload_uuid("patient_id")
                .or_else(|| models.appointment_patient(appointment_id));
            if let Some(patient) = patient
                && let Some(status) = models.patient_status(patient)
                && status.is_terminal()
            {
                violations.push(Violation {
                    code: InvariantCode::PL2,
                    stale_snapshot: serde_json::json!({ "patient_status": "active" }),
                    current_snapshot: serde_json::json!({ "patient_status": status }),
                    auto_cancel_appointment: Some(appointment_id),
                });
            }
        }

        // Documentation against a closed encounter.
        if event_type.starts_with("clinical.observation.")
            || event_type == "clinical.judgment.DiagnosisMade"
        {
            if let Some(encounter) = envelope.payload_uuid("encounter_id")
                && let Some(state) = models.encounter_state(encounter)
                && state.is_closed()
            {
                violations.push(Violation {
                    code: InvariantCode::CO2,
                    stale_snapshot: serde_json::json!({ "encounter_state": "in_progress" }),
                    current_snapshot: serde_json::json!({ "encounter_state": state }),
                    auto_cancel_appointment: None,
                });
            }
        }

        // Diagnosis for a terminal patient.
        if event_type == "clinical.judgment.DiagnosisMade"
            && let Some(patient) = envelope.payload_uuid("patient_id")
            && let Some(status) = models.patient_status(patient)
            && status.is_terminal()
        {
            violations.push(Violation {
                code: InvariantCode::PL2,
                stale_snapshot: serde_json::json!({ "patient_status": "active" }),
                current_snapshot: serde_json::json!({ "patient_status": status }),
                auto_cancel_appointment: None,
            });
        }

        // Treatment plan against a resolved diagnosis.
        if event_type == "clinical.care.TreatmentPlanEstablished"
            && let Some(diagnosis) = envelope.payload_uuid("diagnosis_id")
            && let Some(status) = models.diagnosis_status(diagnosis)
            && status == crate::readmodel::DiagnosisStatus::Resolved
        {
            violations.push(Violation {
                code: InvariantCode::CJ5,
                stale_snapshot: serde_json::json!({ "diagnosis_status": "made" }),
                current_snapshot: serde_json::json!({ "diagnosis_status": status }),
                auto_cancel_appointment: None,
            });
        }

        // Concurrent active encounters for the same patient/practitioner.
        if matches!(
            event_type,
            "clinical.encounter.EncounterBegan" | "clinical.encounter.EncounterReopened"
        ) {
            let encounter_id = envelope.aggregate_id();
            if let Some((Some(patient), Some(practitioner))) =
                models.encounter_parties(encounter_id)
            {
                let active = models.active_encounters_for(patient, practitioner);
                if active > 1 {
                    violations.push(Violation {
                        code: InvariantCode::EP3,
                        stale_snapshot: serde_json::json!({ "active_encounters": 1 }),
                        current_snapshot: serde_json::json!({ "active_encounters": active }),
                        auto_cancel_appointment: None,
                    });
                }
            }
        }

        violations
    }

    /// Deterministic id of the review item for (original event, code).
    pub fn review_event_id(original_event_id: Uuid, code: InvariantCode) -> Uuid {
        let name = format!("{original_event_id}/{}", code.as_str());
        Uuid::new_v5(&COMPENSATION_NAMESPACE, name.as_bytes())
    }

    /// Deterministic id of the auto-cancel emitted for an original event.
    pub fn auto_cancel_event_id(original_event_id: Uuid) -> Uuid {
        let name = format!("{original_event_id}/auto-cancel");
        Uuid::new_v5(&COMPENSATION_NAMESPACE, name.as_bytes())
    }

    /// Build the `CompensationRequired` envelope for a violation.
    ///
    /// Review items live in the `compensation_review` stream keyed by the
    /// violating aggregate; `version` must continue that stream.
    pub fn review_envelope(
        &self,
        original: &EventEnvelope,
        code: InvariantCode,
        stale_snapshot: serde_json::Value,
        current_snapshot: serde_json::Value,
        rejected_envelope: Option<&EventEnvelope>,
        version: u64,
        hub: &HubStamp<'_>,
    ) -> EventEnvelope {
        let payload = CompensationPayload {
            original_event_id: original.event_id(),
            invariant_code: code,
            stale_snapshot,
            current_snapshot,
            original_envelope: rejected_envelope.cloned().map(Box::new),
        };
        EventEnvelope {
            metadata: EventMetadata {
                event_id: Self::review_event_id(original.event_id(), code),
                event_type: COMPENSATION_EVENT_TYPE.to_string(),
                schema_version: 1,
                aggregate_id: original.aggregate_id(),
                aggregate_type: AggregateKind::CompensationReview,
                aggregate_version: version,
                occurred_at: hub.clock.now(),
                recorded_at: hub.clock.now(),
                performed_by: Uuid::nil(),
                performer_role: PerformerRole::System,
                organization_id: hub.organization_id,
                facility_id: hub.facility_id,
                device_id: hub.session.device_id().to_string(),
                connection_status: ConnectionStatus::Online,
                device_clock_drift_ms: 0,
                local_sequence_number: hub.session.next_lsn(),
                sync_batch_id: original.metadata.sync_batch_id,
                correlation_id: original.metadata.correlation_id,
                causation_id: Some(original.event_id()),
                visibility: default_visibility(),
            },
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Build the auto-compensating practice cancellation for an
    /// appointment kept alive past the patient's terminal event.
    pub fn auto_cancel_envelope(
        &self,
        original: &EventEnvelope,
        appointment_id: Uuid,
        version: u64,
        hub: &HubStamp<'_>,
    ) -> EventEnvelope {
        EventEnvelope {
            metadata: EventMetadata {
                event_id: Self::auto_cancel_event_id(original.event_id()),
                event_type: "clinical.scheduling.AppointmentCancelledByPractice".to_string(),
                schema_version: 1,
                aggregate_id: appointment_id,
                aggregate_type: AggregateKind::Appointment,
                aggregate_version: version,
                occurred_at: hub.clock.now(),
                recorded_at: hub.clock.now(),
                performed_by: Uuid::nil(),
                performer_role: PerformerRole::System,
                organization_id: hub.organization_id,
                facility_id: hub.facility_id,
                device_id: hub.session.device_id().to_string(),
                connection_status: ConnectionStatus::Online,
                device_clock_drift_ms: 0,
                local_sequence_number: hub.session.next_lsn(),
                sync_batch_id: None,
                correlation_id: original.metadata.correlation_id,
                causation_id: Some(original.event_id()),
                visibility: default_visibility(),
            },
            payload: serde_json::json!({
                "reason": "patient registration is terminal",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::envelope::test_fixtures::envelope;
    use crate::projection::Projection;
    use chrono::DateTime;

    fn models_with(events: &[EventEnvelope]) -> SharedReadModels {
        let shared = SharedReadModels::new();
        let mut feed = shared.clone();
        for event in events {
            feed.apply(event).expect("apply");
        }
        shared
    }

    fn hub_session() -> DeviceSession {
        DeviceSession::new("hub")
    }

    fn clock() -> FixedClock {
        FixedClock::at(
            DateTime::parse_from_rfc3339("2026-03-01T12:00:00+00:00").expect("valid rfc3339"),
        )
    }

    fn with_payload(
        kind: AggregateKind,
        id: Uuid,
        version: u64,
        event_type: &str,
        payload: serde_json::Value,
    ) -> EventEnvelope {
        let mut env = envelope(kind, id, version, event_type);
        env.payload = payload;
        env
    }

    #[test]
    fn appointment_for_deceased_patient_auto_compensates() {
        let patient = Uuid::new_v4();
        let appointment = Uuid::new_v4();
        let models = models_with(&[
            envelope(AggregateKind::PatientRegistration, patient, 1, "clinical.patient.PatientRegistered"),
            envelope(AggregateKind::PatientRegistration, patient, 2, "clinical.patient.PatientDeceasedRecorded"),
            with_payload(
                AggregateKind::Appointment,
                appointment,
                1,
                "clinical.scheduling.AppointmentRequested",
                serde_json::json!({ "patient_id": patient.to_string() }),
            ),
            envelope(AggregateKind::Appointment, appointment, 2, "clinical.scheduling.AppointmentConfirmed"),
        ]);

        let engine = CompensationEngine::new();
        let confirmed =
            envelope(AggregateKind::Appointment, appointment, 2, "clinical.scheduling.AppointmentConfirmed");
        let violations = engine.check_event(&confirmed, &models);

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].code, InvariantCode::PL2);
        assert_eq!(violations[0].auto_cancel_appointment, Some(appointment));
    }

    #[test]
    fn observation_after_closed_encounter_flags_co2_without_auto() {
        let encounter = Uuid::new_v4();
        let models = models_with(&[
            envelope(AggregateKind::Encounter, encounter, 1, "clinical.encounter.PatientCheckedIn"),
            envelope(AggregateKind::Encounter, encounter, 2, "clinical.encounter.EncounterBegan"),
            envelope(AggregateKind::Encounter, encounter, 3, "clinical.encounter.EncounterCompleted"),
        ]);

        let observation = with_payload(
            AggregateKind::VitalSigns,
            Uuid::new_v4(),
            1,
            "clinical.observation.VitalSignsRecorded",
            serde_json::json!({ "encounter_id": encounter.to_string() }),
        );
        let violations = CompensationEngine::new().check_event(&observation, &models);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].code, InvariantCode::CO2);
        assert!(violations[0].auto_cancel_appointment.is_none());
    }

    #[test]
    fn treatment_plan_for_resolved_diagnosis_flags_cj5() {
        let diagnosis = Uuid::new_v4();
        let models = models_with(&[
            envelope(AggregateKind::Diagnosis, diagnosis, 1, "clinical.judgment.DiagnosisMade"),
            envelope(AggregateKind::Diagnosis, diagnosis, 2, "clinical.judgment.DiagnosisResolved"),
        ]);
        let plan = with_payload(
            AggregateKind::TreatmentPlan,
            Uuid::new_v4(),
            1,
            "clinical.care.TreatmentPlanEstablished",
            serde_json::json!({ "diagnosis_id": diagnosis.to_string() }),
        );
        let violations = CompensationEngine::new().check_event(&plan, &models);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].code, InvariantCode::CJ5);
    }

    #[test]
    fn concurrent_active_encounters_flag_ep3() {
        let patient = Uuid::new_v4();
        let practitioner = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let parties = serde_json::json!({
            "patient_id": patient.to_string(),
            "practitioner_id": practitioner.to_string(),
        });
        let models = models_with(&[
            with_payload(AggregateKind::Encounter, first, 1, "clinical.encounter.PatientCheckedIn", parties.clone()),
            envelope(AggregateKind::Encounter, first, 2, "clinical.encounter.EncounterBegan"),
            with_payload(AggregateKind::Encounter, second, 1, "clinical.encounter.PatientCheckedIn", parties),
            envelope(AggregateKind::Encounter, second, 2, "clinical.encounter.EncounterBegan"),
        ]);

        let began = envelope(AggregateKind::Encounter, second, 2, "clinical.encounter.EncounterBegan");
        let violations = CompensationEngine::new().check_event(&began, &models);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].code, InvariantCode::EP3);
    }

    #[test]
    fn clean_event_produces_no_violations() {
        let patient = Uuid::new_v4();
        let models = models_with(&[envelope(
            AggregateKind::PatientRegistration,
            patient,
            1,
            "clinical.patient.PatientRegistered",
        )]);
        let diagnosis = with_payload(
            AggregateKind::Diagnosis,
            Uuid::new_v4(),
            1,
            "clinical.judgment.DiagnosisMade",
            serde_json::json!({ "patient_id": patient.to_string() }),
        );
        assert!(CompensationEngine::new().check_event(&diagnosis, &models).is_empty());
    }

    #[test]
    fn review_ids_are_deterministic_per_event_and_code() {
        let original = Uuid::new_v4();
        let a = CompensationEngine::review_event_id(original, InvariantCode::PL2);
        let b = CompensationEngine::review_event_id(original, InvariantCode::PL2);
        let c = CompensationEngine::review_event_id(original, InvariantCode::CO2);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn review_envelope_references_original() {
        let session = hub_session();
        let clock = clock();
        let hub = HubStamp {
            session: &session,
            clock: &clock,
            organization_id: Uuid::new_v4(),
            facility_id: Uuid::new_v4(),
        };
        let original = envelope(
            AggregateKind::Appointment,
            Uuid::new_v4(),
            2,
            "clinical.scheduling.AppointmentConfirmed",
        );
        let review = CompensationEngine::new().review_envelope(
            &original,
            InvariantCode::PL2,
            serde_json::json!({"patient_status": "active"}),
            serde_json::json!({"patient_status": "deceased"}),
            None,
            1,
            &hub,
        );
        assert_eq!(review.aggregate_type(), AggregateKind::CompensationReview);
        assert_eq!(review.metadata.causation_id, Some(original.event_id()));
        let payload: CompensationPayload =
            serde_json::from_value(review.payload.clone()).expect("payload decodes");
        assert_eq!(payload.original_event_id, original.event_id());
        assert_eq!(payload.invariant_code, InvariantCode::PL2);
    }

    #[test]
    fn rejected_envelope_is_preserved_verbatim() {
        let session = hub_session();
        let clock = clock();
        let hub = HubStamp {
            session: &session,
            clock: &clock,
            organization_id: Uuid::new_v4(),
            facility_id: Uuid::new_v4(),
        };
        let rejected = envelope(
            AggregateKind::Encounter,
            Uuid::new_v4(),
            3,
            "clinical.encounter.PatientTriaged",
        );
        let review = CompensationEngine::new().review_envelope(
            &rejected,
            InvariantCode::EP1,
            serde_json::Value::Null,
            serde_json::Value::Null,
            Some(&rejected),
            1,
            &hub,
        );
        let payload: CompensationPayload =
            serde_json::from_value(review.payload.clone()).expect("payload decodes");
        assert_eq!(*payload.original_envelope.expect("embedded"), rejected);
    }
}
