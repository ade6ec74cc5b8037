//! The clinical domain: seven lifecycle aggregates and seven fact
//! aggregates, one module per family.
//!
//! Lifecycle aggregates carry a finite state machine; fact aggregates hold
//! exactly one event and freeze. Every module follows the same layout:
//! state, commands, events, the `Aggregate` impl, tests.

pub mod allergy;
pub mod appointment;
pub mod care;
pub mod diagnosis;
pub mod duplicate;
pub mod encounter;
pub mod note;
pub mod observation;
pub mod patient;

pub use allergy::{AllergyCommand, AllergyEvent, AllergyRecord, AllergyState};
pub use appointment::{Appointment, AppointmentCommand, AppointmentEvent, AppointmentStage};
pub use care::{
    Procedure, ProcedureCommand, ProcedureEvent, Referral, ReferralCommand, ReferralEvent,
    TreatmentPlan, TreatmentPlanCommand, TreatmentPlanEvent,
};
pub use diagnosis::{Diagnosis, DiagnosisCommand, DiagnosisEvent, DiagnosisState};
pub use duplicate::{
    DuplicateCommand, DuplicateDecision, DuplicateEvent, DuplicateResolution, DuplicateState,
};
pub use encounter::{Encounter, EncounterCommand, EncounterEvent, EncounterStage};
pub use note::{ClinicalNote, NoteCommand, NoteEvent};
pub use observation::{
    ExaminationFinding, ExaminationFindingCommand, ExaminationFindingEvent, LabResult,
    LabResultCommand, LabResultEvent, Symptom, SymptomCommand, SymptomEvent, VitalSigns,
    VitalSignsCommand, VitalSignsEvent,
};
pub use patient::{PatientCommand, PatientEvent, PatientLifecycle, PatientRegistration};
