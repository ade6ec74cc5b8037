//! Care fact aggregates: procedures, referrals, and treatment plans.
//!
//! Same single-event discipline as the observation facts. A treatment plan
//! names the diagnosis it addresses; whether that diagnosis is still open
//! is a cross-aggregate concern checked by the command handler and, at sync
//! time, by the compensation engine.

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
// Procedure
// ---------------------------------------------------------------------------

/// A performed procedure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub recorded: bool,
    pub patient_id: Option<Uuid>,
    pub encounter_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProcedureCommand {
    Record {
        patient_id: Uuid,
        encounter_id: Uuid,
        procedure_code: String,
        description: String,
        occurred_at: DateTime<FixedOffset>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProcedureEvent {
    ProcedureRecorded {
        patient_id: Uuid,
        encounter_id: Uuid,
        procedure_code: String,
        description: String,
    },
}

impl Aggregate for Procedure {
    const KIND: AggregateKind = AggregateKind::Procedure;
    const EVENT_NAMESPACE: &'static str = "clinical.care";
    type Command = ProcedureCommand;
    type DomainEvent = ProcedureEvent;

    fn decide(
        &self,
        cmd: ProcedureCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<ProcedureEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        if self.recorded {
            return Err(already_recorded("procedure"));
        }
        let ProcedureCommand::Record {
            patient_id,
            encounter_id,
            procedure_code,
            description,
            ..
        } = cmd;
        Ok(vec![ProcedureEvent::ProcedureRecorded {
            patient_id,
            encounter_id,
            procedure_code,
            description,
        }])
    }

    fn apply(mut self, event: &ProcedureEvent) -> Self {
        let ProcedureEvent::ProcedureRecorded {
            patient_id,
            encounter_id,
            ..
        } = event;
        self.recorded = true;
        self.patient_id = Some(*patient_id);
        self.encounter_id = Some(*encounter_id);
        self
    }

    fn admits(&self, _event: &ProcedureEvent) -> bool {
        !self.recorded
    }

    fn occurred_at(cmd: &ProcedureCommand) -> DateTime<FixedOffset> {
        let ProcedureCommand::Record { occurred_at, .. } = cmd;
        *occurred_at
    }
}

// ---------------------------------------------------------------------------
// Referral
// ---------------------------------------------------------------------------

/// A referral to another provider or specialty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    pub recorded: bool,
    pub patient_id: Option<Uuid>,
    pub encounter_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ReferralCommand {
    Issue {
        patient_id: Uuid,
        encounter_id: Uuid,
        specialty: String,
        reason: String,
        occurred_at: DateTime<FixedOffset>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ReferralEvent {
    ReferralIssued {
        patient_id: Uuid,
        encounter_id: Uuid,
        specialty: String,
        reason: String,
    },
}

impl Aggregate for Referral {
    const KIND: AggregateKind = AggregateKind::Referral;
    const EVENT_NAMESPACE: &'static str = "clinical.care";
    type Command = ReferralCommand;
    type DomainEvent = ReferralEvent;

    fn decide(
        &self,
        cmd: ReferralCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<ReferralEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        if self.recorded {
            return Err(already_recorded("referral"));
        }
        let ReferralCommand::Issue {
            patient_id,
            encounter_id,
            specialty,
            reason,
            ..
        } = cmd;
        Ok(vec![ReferralEvent::ReferralIssued {
            patient_id,
            encounter_id,
            specialty,
            reason,
        }])
    }

    fn apply(mut self, event: &ReferralEvent) -> Self {
        let ReferralEvent::ReferralIssued {
            patient_id,
            encounter_id,
            ..
        } = event;
        self.recorded = true;
        self.patient_id = Some(*patient_id);
        self.encounter_id = Some(*encounter_id);
        self
    }

    fn admits(&self, _event: &ReferralEvent) -> bool {
        !self.recorded
    }

    fn occurred_at(cmd: &ReferralCommand) -> DateTime<FixedOffset> {
        let ReferralCommand::Issue { occurred_at, .. } = cmd;
        *occurred_at
    }
}

// ---------------------------------------------------------------------------
// TreatmentPlan
// ---------------------------------------------------------------------------

/// A treatment plan addressing a diagnosis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreatmentPlan {
    pub recorded: bool,
    pub patient_id: Option<Uuid>,
    pub diagnosis_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TreatmentPlanCommand {
    Establish {
        patient_id: Uuid,
        diagnosis_id: Uuid,
        plan: String,
        occurred_at: DateTime<FixedOffset>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TreatmentPlanEvent {
    TreatmentPlanEstablished {
        patient_id: Uuid,
        diagnosis_id: Uuid,
        plan: String,
    },
}

impl Aggregate for TreatmentPlan {
    const KIND: AggregateKind = AggregateKind::TreatmentPlan;
    const EVENT_NAMESPACE: &'static str = "clinical.care";
    type Command = TreatmentPlanCommand;
    type DomainEvent = TreatmentPlanEvent;

    fn decide(
        &self,
        cmd: TreatmentPlanCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<TreatmentPlanEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        if self.recorded {
            return Err(already_recorded("treatment plan"));
        }
        let TreatmentPlanCommand::Establish {
            patient_id,
            diagnosis_id,
            plan,
            ..
        } = cmd;
        Ok(vec![TreatmentPlanEvent::TreatmentPlanEstablished {
            patient_id,
            diagnosis_id,
            plan,
        }])
    }

    fn apply(mut self, event: &TreatmentPlanEvent) -> Self {
        let TreatmentPlanEvent::TreatmentPlanEstablished {
            patient_id,
            diagnosis_id,
            ..
        } = event;
        self.recorded = true;
        self.patient_id = Some(*patient_id);
        self.diagnosis_id = Some(*diagnosis_id);
        self
    }

    fn admits(&self, _event: &TreatmentPlanEvent) -> bool {
        !self.recorded
    }

    fn occurred_at(cmd: &TreatmentPlanCommand) -> DateTime<FixedOffset> {
        let TreatmentPlanCommand::Establish { occurred_at, .. } = cmd;
        *occurred_at
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn clock() -> FixedClock {
        FixedClock::at(
            DateTime::parse_from_rfc3339("2026-03-01T09:00:00+00:00").expect("valid rfc3339"),
        )
    }

    fn at() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-03-01T08:55:00+00:00").expect("valid rfc3339")
    }

    #[test]
    fn procedure_records_once_co3() {
        let cmd = || ProcedureCommand::Record {
            patient_id: Uuid::new_v4(),
            encounter_id: Uuid::new_v4(),
            procedure_code: "69436".into(),
            description: "tympanostomy".into(),
            occurred_at: at(),
        };
        let events = Procedure::default().decide(cmd(), &clock()).expect("record");
        let p = events.iter().fold(Procedure::default(), |s, e| s.apply(e));
        let err = p.decide(cmd(), &clock()).unwrap_err();
        assert_eq!(err.code, InvariantCode::CO3);
    }

    #[test]
    fn referral_issue_once() {
        let events = Referral::default()
            .decide(
                ReferralCommand::Issue {
                    patient_id: Uuid::new_v4(),
                    encounter_id: Uuid::new_v4(),
                    specialty: "otolaryngology".into(),
                    reason: "recurrent infections".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .expect("issue should succeed");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn treatment_plan_links_diagnosis() {
        let diagnosis_id = Uuid::new_v4();
        let events = TreatmentPlan::default()
            .decide(
                TreatmentPlanCommand::Establish {
                    patient_id: Uuid::new_v4(),
                    diagnosis_id,
                    plan: "amoxicillin 500mg, recheck in 10 days".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .expect("establish should succeed");
        let t = events.iter().fold(TreatmentPlan::default(), |s, e| s.apply(e));
        assert_eq!(t.diagnosis_id, Some(diagnosis_id));
        assert!(!t.admits(&events[0]));
    }
}
