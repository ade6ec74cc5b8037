//! Internal read models consulted by command handlers for cross-aggregate
//! preconditions.
//!
//! Five deterministic materializations, all keyed by aggregate or actor id:
//! patient status, encounter state, diagnosis status, appointment status,
//! and observed performer roles. They are owned by the dispatcher, fed in
//! insertion order, rebuildable by replay, and deliberately minimal: a
//! handler needs a status, not a document.
//!
//! Offline these may be stale; that is by design. The handler consults the
//! best available local state and the sync-time compensation engine
//! re-checks on the hub.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{EventEnvelope, PerformerRole};
use crate::projection::{Projection, ProjectionError};

/// Lifecycle summary of a patient registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientStatus {
    Active,
    Deceased,
    TransferredOut,
}

impl PatientStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deceased | Self::TransferredOut)
    }
}

/// Stage summary of an encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncounterState {
    CheckedIn,
    Triaged,
    InProgress,
    Completed,
    Discharged,
}

impl EncounterState {
    /// An encounter accepts clinical documentation only while in progress.
    pub fn is_active(&self) -> bool {
        *self == Self::InProgress
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Completed | Self::Discharged)
    }
}

/// Status summary of a diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisStatus {
    Made,
    Resolved,
}

/// Status summary of an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Requested,
    Confirmed,
    CancelledByPatient,
    CancelledByPractice,
    NoShowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EncounterEntry {
    state: EncounterState,
    patient_id: Option<Uuid>,
    practitioner_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AppointmentEntry {
    status: AppointmentStatus,
    patient_id: Option<Uuid>,
}

/// The five handler-facing read models, folded together from one feed.
#[derive(Debug, Default)]
pub struct ReadModels {
    patients: HashMap<Uuid, PatientStatus>,
    encounters: HashMap<Uuid, EncounterEntry>,
    diagnoses: HashMap<Uuid, DiagnosisStatus>,
    appointments: HashMap<Uuid, AppointmentEntry>,
    performer_roles: HashMap<Uuid, PerformerRole>,
}

impl ReadModels {
    pub fn patient_status(&self, patient_id: Uuid) -> Option<PatientStatus> {
        self.patients.get(&patient_id).copied()
    }

    pub fn encounter_state(&self, encounter_id: Uuid) -> Option<EncounterState> {
        self.encounters.get(&encounter_id).map(|e| e.state)
    }

    pub fn diagnosis_status(&self, diagnosis_id: Uuid) -> Option<DiagnosisStatus> {
        self.diagnoses.get(&diagnosis_id).copied()
    }

    pub fn appointment_status(&self, appointment_id: Uuid) -> Option<AppointmentStatus> {
        self.appointments.get(&appointment_id).map(|a| a.status)
    }

    /// The patient an appointment was requested for.
    pub fn appointment_patient(&self, appointment_id: Uuid) -> Option<Uuid> {
        self.appointments.get(&appointment_id).and_then(|a| a.patient_id)
    }

    /// Patient and practitioner of an encounter, when known.
    pub fn encounter_parties(&self, encounter_id: Uuid) -> Option<(Option<Uuid>, Option<Uuid>)> {
        self.encounters
            .get(&encounter_id)
            .map(|e| (e.patient_id, e.practitioner_id))
    }

    /// The role last observed for an actor.
    pub fn performer_role(&self, actor_id: Uuid) -> Option<PerformerRole> {
        self.performer_roles.get(&actor_id).copied()
    }

    /// Count of in-progress encounters for a patient/practitioner pair.
    /// Backs the concurrent-encounter check (`INV-EP-3`).
    pub fn active_encounters_for(&self, patient_id: Uuid, practitioner_id: Uuid) -> usize {
        self.encounters
            .values()
            .filter(|e| {
                e.state.is_active()
                    && e.patient_id == Some(patient_id)
                    && e.practitioner_id == Some(practitioner_id)
            })
            .count()
    }

    /// Fold one envelope. Unknown event types are ignored.
    pub fn fold(&mut self, envelope: &EventEnvelope) {
        let id = envelope.aggregate_id();
        self.performer_roles.insert(
            envelope.metadata.performed_by,
            envelope.metadata.performer_role,
        );
        match envelope.event_type() {
            "clinical.patient.PatientRegistered" => {
                self.patients.insert(id, PatientStatus::Active);
            }
            "clinical.patient.PatientDeceasedRecorded" => {
                self.patients.insert(id, PatientStatus::Deceased);
            }
            "clinical.patient.PatientTransferredOut" => {
                self.patients.insert(id, PatientStatus::TransferredOut);
            }
            "clinical.encounter.PatientCheckedIn" => {
                self.encounters.insert(
                    id,
                    EncounterEntry {
                        state: EncounterState::CheckedIn,
                        patient_id: envelope.payload_uuid("patient_id"),
                        practitioner_id: envelope.payload_uuid("practitioner_id"),
                    },
                );
            }
            "clinical.encounter.PatientTriaged" => self.set_encounter(id, EncounterState::Triaged),
            "clinical.encounter.EncounterBegan" | "clinical.encounter.EncounterReopened" => {
                self.set_encounter(id, EncounterState::InProgress)
            }
            "clinical.encounter.EncounterCompleted" => {
                self.set_encounter(id, EncounterState::Completed)
            }
            "clinical.encounter.PatientDischarged" => {
                self.set_encounter(id, EncounterState::Discharged)
            }
            "clinical.judgment.DiagnosisMade" => {
                self.diagnoses.insert(id, DiagnosisStatus::Made);
            }
            "clinical.judgment.DiagnosisResolved" => {
                self.diagnoses.insert(id, DiagnosisStatus::Resolved);
            }
            "clinical.scheduling.AppointmentRequested" => {
                self.appointments.insert(
                    id,
                    AppointmentEntry {
                        status: AppointmentStatus::Requested,
                        patient_id: envelope.payload_uuid("patient_id"),
                    },
                );
            }
            "clinical.scheduling.AppointmentConfirmed" => {
                self.set_appointment(id, AppointmentStatus::Confirmed);
            }
            "clinical.scheduling.AppointmentCancelledByPatient" => {
                self.set_appointment(id, AppointmentStatus::CancelledByPatient);
            }
            "clinical.scheduling.AppointmentCancelledByPractice" => {
                self.set_appointment(id, AppointmentStatus::CancelledByPractice);
            }
            "clinical.scheduling.AppointmentNoShowed" => {
                self.set_appointment(id, AppointmentStatus::NoShowed);
            }
            _ => {}
        }
    }

    fn set_appointment(&mut self, id: Uuid, status: AppointmentStatus) {
        if let Some(entry) = self.appointments.get_mut(&id) {
            entry.status = status;
        } else {
            self.appointments.insert(
                id,
                AppointmentEntry {
                    status,
                    patient_id: None,
                },
            );
        }
    }

    fn set_encounter(&mut self, id: Uuid, state: EncounterState) {
        if let Some(entry) = self.encounters.get_mut(&id) {
            entry.state = state;
        } else {
            // Stream arrived without its check-in (e.g. filtered replay);
            // track the state, leave the parties unknown.
            self.encounters.insert(
                id,
                EncounterEntry {
                    state,
                    patient_id: None,
                    practitioner_id: None,
                },
            );
        }
    }

    /// Rebuild from scratch over a full event sequence.
    pub fn rebuild<'a>(events: impl IntoIterator<Item = &'a EventEnvelope>) -> Self {
        let mut models = Self::default();
        for envelope in events {
            models.fold(envelope);
        }
        models
    }
}

/// Cloneable handle over the shared [`ReadModels`] bundle.
///
/// The dispatcher registers a clone as a live projection; command handlers
/// read snapshots through another clone.
#[derive(Debug, Clone, Default)]
pub struct SharedReadModels {
    inner: Arc<RwLock<ReadModels>>,
}

impl SharedReadModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patient_status(&self, patient_id: Uuid) -> Option<PatientStatus> {
        self.inner.read().expect("read models poisoned").patient_status(patient_id)
    }

    pub fn encounter_state(&self, encounter_id: Uuid) -> Option<EncounterState> {
        self.inner.read().expect("read models poisoned").encounter_state(encounter_id)
    }

    pub fn diagnosis_status(&self, diagnosis_id: Uuid) -> Option<DiagnosisStatus> {
        self.inner.read().expect("read models poisoned").diagnosis_status(diagnosis_id)
    }

    pub fn appointment_status(&self, appointment_id: Uuid) -> Option<AppointmentStatus> {
        self.inner.read().expect("read models poisoned").appointment_status(appointment_id)
    }

    pub fn appointment_patient(&self, appointment_id: Uuid) -> Option<Uuid> {
        self.inner.read().expect("read models poisoned").appointment_patient(appointment_id)
    }

    pub fn encounter_parties(&self, encounter_id: Uuid) -> Option<(Option<Uuid>, Option<Uuid>)> {
        self.inner.read().expect("read models poisoned").encounter_parties(encounter_id)
    }

    pub fn performer_role(&self, actor_id: Uuid) -> Option<PerformerRole> {
        self.inner.read().expect("read models poisoned").performer_role(actor_id)
    }

    pub fn active_encounters_for(&self, patient_id: Uuid, practitioner_id: Uuid) -> usize {
        self.inner
            .read()
            .expect("read models poisoned")
            .active_encounters_for(patient_id, practitioner_id)
    }

    /// Drop all state and refold the given sequence.
    pub fn rebuild_from<'a>(&self, events: impl IntoIterator<Item = &'a EventEnvelope>) {
        let mut inner = self.inner.write().expect("read models poisoned");
        *inner = ReadModels::rebuild(events);
    }
}

impl Projection for SharedReadModels {
    fn name(&self) -> &'static str {
        "handler-read-models"
    }

    fn apply(&mut self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        self.inner
            .write()
            .map_err(|e| ProjectionError(e.to_string()))?
            .fold(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::AggregateKind;
    use crate::envelope::test_fixtures::envelope;

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
    fn patient_status_follows_lifecycle() {
        let patient = Uuid::new_v4();
        let mut models = ReadModels::default();
        models.fold(&envelope(
            AggregateKind::PatientRegistration,
            patient,
            1,
            "clinical.patient.PatientRegistered",
        ));
        assert_eq!(models.patient_status(patient), Some(PatientStatus::Active));
        models.fold(&envelope(
            AggregateKind::PatientRegistration,
            patient,
            2,
            "clinical.patient.PatientDeceasedRecorded",
        ));
        assert_eq!(models.patient_status(patient), Some(PatientStatus::Deceased));
        assert!(models.patient_status(patient).expect("present").is_terminal());
    }

    #[test]
    fn encounter_state_tracks_stream() {
        let encounter = Uuid::new_v4();
        let patient = Uuid::new_v4();
        let practitioner = Uuid::new_v4();
        let mut models = ReadModels::default();
        models.fold(&with_payload(
            AggregateKind::Encounter,
            encounter,
            1,
            "clinical.encounter.PatientCheckedIn",
            serde_json::json!({
                "patient_id": patient.to_string(),
                "practitioner_id": practitioner.to_string(),
            }),
        ));
        models.fold(&envelope(
            AggregateKind::Encounter,
            encounter,
            2,
            "clinical.encounter.EncounterBegan",
        ));
        assert_eq!(models.encounter_state(encounter), Some(EncounterState::InProgress));
        assert_eq!(models.active_encounters_for(patient, practitioner), 1);

        models.fold(&envelope(
            AggregateKind::Encounter,
            encounter,
            3,
            "clinical.encounter.EncounterCompleted",
        ));
        assert_eq!(models.encounter_state(encounter), Some(EncounterState::Completed));
        assert_eq!(models.active_encounters_for(patient, practitioner), 0);
        assert!(models.encounter_state(encounter).expect("present").is_closed());
    }

    #[test]
    fn rebuild_equals_incremental_fold() {
        let patient = Uuid::new_v4();
        let diagnosis = Uuid::new_v4();
        let events = vec![
            envelope(
                AggregateKind::PatientRegistration,
                patient,
                1,
                "clinical.patient.PatientRegistered",
            ),
            envelope(AggregateKind::Diagnosis, diagnosis, 1, "clinical.judgment.DiagnosisMade"),
            envelope(AggregateKind::Diagnosis, diagnosis, 2, "clinical.judgment.DiagnosisResolved"),
        ];
        let mut incremental = ReadModels::default();
        for event in &events {
            incremental.fold(event);
        }
        let rebuilt = ReadModels::rebuild(&events);
        assert_eq!(rebuilt.patient_status(patient), incremental.patient_status(patient));
        assert_eq!(
            rebuilt.diagnosis_status(diagnosis),
            Some(DiagnosisStatus::Resolved)
        );
    }

    #[test]
    fn performer_roles_observed_from_any_event() {
        let env = envelope(
            AggregateKind::Symptom,
            Uuid::new_v4(),
            1,
            "clinical.observation.SymptomReported",
        );
        let mut models = ReadModels::default();
        models.fold(&env);
        assert_eq!(
            models.performer_role(env.metadata.performed_by),
            Some(env.metadata.performer_role)
        );
    }

    #[test]
    fn shared_handle_feeds_and_reads() {
        let shared = SharedReadModels::new();
        let mut as_projection = shared.clone();
        let patient = Uuid::new_v4();
        as_projection
            .apply(&envelope(
                AggregateKind::PatientRegistration,
                patient,
                1,
                "clinical.patient.PatientRegistered",
            ))
            .expect("apply");
        assert_eq!(shared.patient_status(patient), Some(PatientStatus::Active));
    }

    #[test]
    fn unknown_event_types_ignored() {
        let mut models = ReadModels::default();
        models.fold(&envelope(
            AggregateKind::Encounter,
            Uuid::new_v4(),
            1,
            "clinical.future.NotYetInvented",
        ));
        // No panic, no state beyond the performer role observation.
        assert_eq!(models.encounters.len(), 0);
    }
}
