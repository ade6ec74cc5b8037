//! Observation fact aggregates: vital signs, symptoms, examination
//! findings, and lab results.
//!
//! Each observation is a fact aggregate: exactly one event ever enters the
//! stream, and the state is frozen afterwards. Attempting a second
//! recording is rejected with `INV-CO-3`. Zero contention by design; two
//! devices recording "the same" vitals produce two aggregates.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{Aggregate, DomainError, guard_occurred_at};
use crate::clock::Clock;
use crate::envelope::AggregateKind;
use crate::invariant::InvariantCode;

fn already_recorded(what: &str) -> DomainError {
    DomainError::new(InvariantCode::CO3, format!("{what} is already recorded"))
}

// ---------------------------------------------------------------------------
// VitalSigns
// ---------------------------------------------------------------------------

/// A single set of vital-sign measurements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VitalSigns {
    pub recorded: bool,
    pub patient_id: Option<Uuid>,
    pub encounter_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum VitalSignsCommand {
    Record {
        patient_id: Uuid,
        encounter_id: Uuid,
        systolic_mmhg: u16,
        diastolic_mmhg: u16,
        heart_rate_bpm: u16,
        temperature_dc: i16,
        respiratory_rate: u16,
        occurred_at: DateTime<FixedOffset>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum VitalSignsEvent {
    VitalSignsRecorded {
        patient_id: Uuid,
        encounter_id: Uuid,
        systolic_mmhg: u16,
        diastolic_mmhg: u16,
        heart_rate_bpm: u16,
        /// Temperature in tenths of a degree Celsius, avoiding floats.
        temperature_dc: i16,
        respiratory_rate: u16,
    },
}

impl Aggregate for VitalSigns {
    const KIND: AggregateKind = AggregateKind::VitalSigns;
    const EVENT_NAMESPACE: &'static str = "clinical.observation";
    type Command = VitalSignsCommand;
    type DomainEvent = VitalSignsEvent;

    fn decide(
        &self,
        cmd: VitalSignsCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<VitalSignsEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        if self.recorded {
            return Err(already_recorded("vital signs set"));
        }
        let VitalSignsCommand::Record {
            patient_id,
            encounter_id,
            systolic_mmhg,
            diastolic_mmhg,
            heart_rate_bpm,
            temperature_dc,
            respiratory_rate,
            ..
        } = cmd;
        Ok(vec![VitalSignsEvent::VitalSignsRecorded {
            patient_id,
            encounter_id,
            systolic_mmhg,
            diastolic_mmhg,
            heart_rate_bpm,
            temperature_dc,
            respiratory_rate,
        }])
    }

    fn apply(mut self, event: &VitalSignsEvent) -> Self {
        let VitalSignsEvent::VitalSignsRecorded {
            patient_id,
            encounter_id,
            ..
        } = event;
        self.recorded = true;
        self.patient_id = Some(*patient_id);
        self.encounter_id = Some(*encounter_id);
        self
    }

    fn admits(&self, _event: &VitalSignsEvent) -> bool {
        !self.recorded
    }

    fn occurred_at(cmd: &VitalSignsCommand) -> DateTime<FixedOffset> {
        let VitalSignsCommand::Record { occurred_at, .. } = cmd;
        *occurred_at
    }
}

// ---------------------------------------------------------------------------
// Symptom
// ---------------------------------------------------------------------------

/// A patient-reported symptom.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Symptom {
    pub recorded: bool,
    pub patient_id: Option<Uuid>,
    pub encounter_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SymptomCommand {
    Report {
        patient_id: Uuid,
        encounter_id: Uuid,
        description: String,
        severity: String,
        occurred_at: DateTime<FixedOffset>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SymptomEvent {
    SymptomReported {
        patient_id: Uuid,
        encounter_id: Uuid,
        description: String,
        severity: String,
    },
}

impl Aggregate for Symptom {
    const KIND: AggregateKind = AggregateKind::Symptom;
    const EVENT_NAMESPACE: &'static str = "clinical.observation";
    type Command = SymptomCommand;
    type DomainEvent = SymptomEvent;

    fn decide(
        &self,
        cmd: SymptomCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<SymptomEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        if self.recorded {
            return Err(already_recorded("symptom report"));
        }
        let SymptomCommand::Report {
            patient_id,
            encounter_id,
            description,
            severity,
            ..
        } = cmd;
        Ok(vec![SymptomEvent::SymptomReported {
            patient_id,
            encounter_id,
            description,
            severity,
        }])
    }

    fn apply(mut self, event: &SymptomEvent) -> Self {
        let SymptomEvent::SymptomReported {
            patient_id,
            encounter_id,
            ..
        } = event;
        self.recorded = true;
        self.patient_id = Some(*patient_id);
        self.encounter_id = Some(*encounter_id);
        self
    }

    fn admits(&self, _event: &SymptomEvent) -> bool {
        !self.recorded
    }

    fn occurred_at(cmd: &SymptomCommand) -> DateTime<FixedOffset> {
        let SymptomCommand::Report { occurred_at, .. } = cmd;
        *occurred_at
    }
}

// ---------------------------------------------------------------------------
// ExaminationFinding
// ---------------------------------------------------------------------------

/// A clinician's examination finding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExaminationFinding {
    pub recorded: bool,
    pub patient_id: Option<Uuid>,
    pub encounter_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExaminationFindingCommand {
    Record {
        patient_id: Uuid,
        encounter_id: Uuid,
        body_site: String,
        finding: String,
        occurred_at: DateTime<FixedOffset>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExaminationFindingEvent {
    ExaminationFindingRecorded {
        patient_id: Uuid,
        encounter_id: Uuid,
        body_site: String,
        finding: String,
    },
}

impl Aggregate for ExaminationFinding {
    const KIND: AggregateKind = AggregateKind::ExaminationFinding;
    const EVENT_NAMESPACE: &'static str = "clinical.observation";
    type Command = ExaminationFindingCommand;
    type DomainEvent = ExaminationFindingEvent;

    fn decide(
        &self,
        cmd: ExaminationFindingCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<ExaminationFindingEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        if self.recorded {
            return Err(already_recorded("examination finding"));
        }
        let ExaminationFindingCommand::Record {
            patient_id,
            encounter_id,
            body_site,
            finding,
            ..
        } = cmd;
        Ok(vec![ExaminationFindingEvent::ExaminationFindingRecorded {
            patient_id,
            encounter_id,
            body_site,
            finding,
        }])
    }

    fn apply(mut self, event: &ExaminationFindingEvent) -> Self {
        let ExaminationFindingEvent::ExaminationFindingRecorded {
            patient_id,
            encounter_id,
            ..
        } = event;
        self.recorded = true;
        self.patient_id = Some(*patient_id);
        self.encounter_id = Some(*encounter_id);
        self
    }

    fn admits(&self, _event: &ExaminationFindingEvent) -> bool {
        !self.recorded
    }

    fn occurred_at(cmd: &ExaminationFindingCommand) -> DateTime<FixedOffset> {
        let ExaminationFindingCommand::Record { occurred_at, .. } = cmd;
        *occurred_at
    }
}

// ---------------------------------------------------------------------------
// LabResult
// ---------------------------------------------------------------------------

/// A laboratory result attached to an encounter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabResult {
    pub recorded: bool,
    pub patient_id: Option<Uuid>,
    pub encounter_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LabResultCommand {
    Record {
        patient_id: Uuid,
        encounter_id: Uuid,
        test_code: String,
        value: String,
        unit: String,
        reference_range: String,
        occurred_at: DateTime<FixedOffset>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LabResultEvent {
    LabResultRecorded {
        patient_id: Uuid,
        encounter_id: Uuid,
        test_code: String,
        value: String,
        unit: String,
        reference_range: String,
    },
}

impl Aggregate for LabResult {
    const KIND: AggregateKind = AggregateKind::LabResult;
    const EVENT_NAMESPACE: &'static str = "clinical.observation";
    type Command = LabResultCommand;
    type DomainEvent = LabResultEvent;

    fn decide(
        &self,
        cmd: LabResultCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<LabResultEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        if self.recorded {
            return Err(already_recorded("lab result"));
        }
        let LabResultCommand::Record {
            patient_id,
            encounter_id,
            test_code,
            value,
            unit,
            reference_range,
            ..
        } = cmd;
        Ok(vec![LabResultEvent::LabResultRecorded {
            patient_id,
            encounter_id,
            test_code,
            value,
            unit,
            reference_range,
        }])
    }

    fn apply(mut self, event: &LabResultEvent) -> Self {
        let LabResultEvent::LabResultRecorded {
            patient_id,
            encounter_id,
            ..
        } = event;
        self.recorded = true;
        self.patient_id = Some(*patient_id);
        self.encounter_id = Some(*encounter_id);
        self
    }

    fn admits(&self, _event: &LabResultEvent) -> bool {
        !self.recorded
    }

    fn occurred_at(cmd: &LabResultCommand) -> DateTime<FixedOffset> {
        let LabResultCommand::Record { occurred_at, .. } = cmd;
        *occurred_at
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
