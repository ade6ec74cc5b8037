//! Diagnosis aggregate.
//!
//! A diagnosis is made once, may be revised any number of times while open,
//! and resolves terminally. A revision that changes nothing is a no-op
//! rather than an error, so offline retries of the same correction converge.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{Aggregate, DomainError, guard_occurred_at};
use crate::clock::Clock;
use crate::envelope::AggregateKind;
use crate::invariant::InvariantCode;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DiagnosisState {
    #[default]
    NotMade,
    Made,
    Resolved,
}

/// A single clinical diagnosis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub state: DiagnosisState,
    pub patient_id: Option<Uuid>,
    pub encounter_id: Option<Uuid>,
    pub condition: String,
    pub icd_code: String,
    pub revision_count: u32,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DiagnosisCommand {
    Make {
        patient_id: Uuid,
        encounter_id: Uuid,
        condition: String,
        icd_code: String,
        occurred_at: DateTime<FixedOffset>,
    },
    Revise {
        condition: String,
        icd_code: String,
        reason: String,
        occurred_at: DateTime<FixedOffset>,
    },
    Resolve {
        outcome: String,
        occurred_at: DateTime<FixedOffset>,
    },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DiagnosisEvent {
    DiagnosisMade {
        patient_id: Uuid,
        encounter_id: Uuid,
        condition: String,
        icd_code: String,
    },
    DiagnosisRevised {
        condition: String,
        icd_code: String,
        reason: String,
    },
    DiagnosisResolved {
        outcome: String,
    },
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for Diagnosis {
    const KIND: AggregateKind = AggregateKind::Diagnosis;
    const EVENT_NAMESPACE: &'static str = "clinical.judgment";
    type Command = DiagnosisCommand;
    type DomainEvent = DiagnosisEvent;

    fn decide(
        &self,
        cmd: DiagnosisCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<DiagnosisEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        match cmd {
            DiagnosisCommand::Make {
                patient_id,
                encounter_id,
                condition,
                icd_code,
                ..
            } => {
                if self.state != DiagnosisState::NotMade {
                    return Err(DomainError::new(
                        InvariantCode::CJ4,
                        "diagnosis has already been made",
                    ));
                }
                Ok(vec![DiagnosisEvent::DiagnosisMade {
                    patient_id,
                    encounter_id,
                    condition,
                    icd_code,
                }])
            }
            DiagnosisCommand::Revise {
                condition,
                icd_code,
                reason,
                ..
            } => match self.state {
                DiagnosisState::NotMade => Err(DomainError::new(
                    InvariantCode::CJ2,
                    "diagnosis does not exist",
                )),
                DiagnosisState::Resolved => Err(DomainError::new(
                    InvariantCode::CJ3,
                    "resolved diagnosis cannot be revised",
                )),
                DiagnosisState::Made => {
                    // Idempotent over content: an identical revision is a no-op.
                    if condition == self.condition && icd_code == self.icd_code {
                        return Ok(vec![]);
                    }
                    Ok(vec![DiagnosisEvent::DiagnosisRevised {
                        condition,
                        icd_code,
                        reason,
                    }])
                }
            },
            DiagnosisCommand::Resolve { outcome, .. } => match self.state {
                DiagnosisState::NotMade => Err(DomainError::new(
                    InvariantCode::CJ2,
                    "diagnosis does not exist",
                )),
                DiagnosisState::Resolved => Err(DomainError::new(
                    InvariantCode::CJ4,
                    "diagnosis is already resolved",
                )),
                DiagnosisState::Made => Ok(vec![DiagnosisEvent::DiagnosisResolved { outcome }]),
            },
        }
    }

    fn apply(mut self, event: &DiagnosisEvent) -> Self {
        match event {
            DiagnosisEvent::DiagnosisMade {
                patient_id,
                encounter_id,
                condition,
                icd_code,
            } => {
                self.state = DiagnosisState::Made;
                self.patient_id = Some(*patient_id);
                self.encounter_id = Some(*encounter_id);
                self.condition = condition.clone();
                self.icd_code = icd_code.clone();
            }
            DiagnosisEvent::DiagnosisRevised {
                condition, icd_code, ..
            } => {
                self.condition = condition.clone();
                self.icd_code = icd_code.clone();
                self.revision_count += 1;
            }
            DiagnosisEvent::DiagnosisResolved { .. } => {
                self.state = DiagnosisState::Resolved;
            }
        }
        self
    }

    fn admits(&self, event: &DiagnosisEvent) -> bool {
        match event {
            DiagnosisEvent::DiagnosisMade { .. } => self.state == DiagnosisState::NotMade,
            DiagnosisEvent::DiagnosisRevised { .. } | DiagnosisEvent::DiagnosisResolved { .. } => {
                self.state == DiagnosisState::Made
            }
        }
    }

    fn occurred_at(cmd: &DiagnosisCommand) -> DateTime<FixedOffset> {
        match cmd {
            DiagnosisCommand::Make { occurred_at, .. }
            | DiagnosisCommand::Revise { occurred_at, .. }
            | DiagnosisCommand::Resolve { occurred_at, .. } => *occurred_at,
        }
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

    fn made() -> Diagnosis {
        let events = Diagnosis::default()
            .decide(
                DiagnosisCommand::Make {
                    patient_id: Uuid::new_v4(),
                    encounter_id: Uuid::new_v4(),
                    condition: "acute otitis media".into(),
                    icd_code: "H66.90".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .expect("make should succeed");
        events.iter().fold(Diagnosis::default(), |s, e| s.apply(e))
    }

    #[test]
    fn make_then_revise_then_resolve() {
        let d = made();
        let events = d
            .decide(
                DiagnosisCommand::Revise {
                    condition: "chronic otitis media".into(),
                    icd_code: "H66.3X9".into(),
                    reason: "persisted beyond six weeks".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .expect("revise should succeed");
        let d = events.iter().fold(d, |s, e| s.apply(e));
        assert_eq!(d.revision_count, 1);
        assert_eq!(d.icd_code, "H66.3X9");

        let events = d
            .decide(
                DiagnosisCommand::Resolve { outcome: "cleared".into(), occurred_at: at() },
                &clock(),
            )
            .expect("resolve should succeed");
        let d = events.iter().fold(d, |s, e| s.apply(e));
        assert_eq!(d.state, DiagnosisState::Resolved);
    }

    #[test]
    fn identical_revision_is_a_no_op() {
        let d = made();
        let events = d
            .decide(
                DiagnosisCommand::Revise {
                    condition: d.condition.clone(),
                    icd_code: d.icd_code.clone(),
                    reason: "retry".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .expect("identical revision should succeed");
        assert!(events.is_empty());
    }

    #[test]
    fn revise_after_resolve_rejected_cj3() {
        let d = made();
        let events = d
            .decide(
                DiagnosisCommand::Resolve { outcome: "cleared".into(), occurred_at: at() },
                &clock(),
            )
            .expect("resolve should succeed");
        let d = events.iter().fold(d, |s, e| s.apply(e));
        let err = d
            .decide(
                DiagnosisCommand::Revise {
                    condition: "x".into(),
                    icd_code: "y".into(),
                    reason: "too late".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::CJ3);
    }

    #[test]
    fn resolve_twice_rejected_cj4() {
        let d = made();
        let events = d
            .decide(
                DiagnosisCommand::Resolve { outcome: "cleared".into(), occurred_at: at() },
                &clock(),
            )
            .expect("resolve should succeed");
        let d = events.iter().fold(d, |s, e| s.apply(e));
        let err = d
            .decide(
                DiagnosisCommand::Resolve { outcome: "again".into(), occurred_at: at() },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::CJ4);
    }

    #[test]
    fn revise_before_make_rejected_cj2() {
        let err = Diagnosis::default()
            .decide(
                DiagnosisCommand::Revise {
                    condition: "x".into(),
                    icd_code: "y".into(),
                    reason: "premature".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::CJ2);
    }

    #[test]
    fn make_twice_rejected_cj4() {
        let d = made();
        let err = d
            .decide(
                DiagnosisCommand::Make {
                    patient_id: Uuid::new_v4(),
                    encounter_id: Uuid::new_v4(),
                    condition: "other".into(),
                    icd_code: "Z00.0".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::CJ4);
    }
}
