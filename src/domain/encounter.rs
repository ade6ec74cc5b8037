//! Encounter aggregate.
//!
//! An encounter moves through check-in, optional triage, an in-progress
//! phase, completion, and discharge. A completed encounter may be reopened
//! for further documentation and then completed again; discharge is only
//! reachable from the completed stage.

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

/// Encounter lifecycle stages.
///
/// Triage is optional: the encounter may begin directly from `CheckedIn`.
/// `EncounterReopened` moves a completed encounter back to `InProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncounterStage {
    #[default]
    NotStarted,
    CheckedIn,
    Triaged,
    InProgress,
    Completed,
    Discharged,
}

/// An ambulatory encounter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Encounter {
    pub stage: EncounterStage,
    pub patient_id: Option<Uuid>,
    pub practitioner_id: Option<Uuid>,
    /// How many times the encounter was reopened after completion.
    pub reopen_count: u32,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands accepted by the [`Encounter`] aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EncounterCommand {
    CheckIn {
        patient_id: Uuid,
        practitioner_id: Uuid,
        occurred_at: DateTime<FixedOffset>,
    },
    Triage {
        acuity_level: u8,
        occurred_at: DateTime<FixedOffset>,
    },
    Begin {
        occurred_at: DateTime<FixedOffset>,
    },
    Complete {
        summary: String,
        occurred_at: DateTime<FixedOffset>,
    },
    Reopen {
        reason: String,
        occurred_at: DateTime<FixedOffset>,
    },
    Discharge {
        disposition: String,
        occurred_at: DateTime<FixedOffset>,
    },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Domain events produced by the [`Encounter`] aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EncounterEvent {
    PatientCheckedIn {
        patient_id: Uuid,
        practitioner_id: Uuid,
    },
    PatientTriaged {
        acuity_level: u8,
    },
    EncounterBegan,
    EncounterCompleted {
        summary: String,
    },
    EncounterReopened {
        reason: String,
    },
    PatientDischarged {
        disposition: String,
    },
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for Encounter {
    const KIND: AggregateKind = AggregateKind::Encounter;
    const EVENT_NAMESPACE: &'static str = "clinical.encounter";
    type Command = EncounterCommand;
    type DomainEvent = EncounterEvent;

    fn decide(
        &self,
        cmd: EncounterCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<EncounterEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        match cmd {
            EncounterCommand::CheckIn {
                patient_id,
                practitioner_id,
                ..
            } => {
                if self.stage != EncounterStage::NotStarted {
                    return Err(self.invalid_transition("check-in"));
                }
                Ok(vec![EncounterEvent::PatientCheckedIn {
                    patient_id,
                    practitioner_id,
                }])
            }
            EncounterCommand::Triage { acuity_level, .. } => {
                self.require_exists()?;
                if self.stage != EncounterStage::CheckedIn {
                    return Err(self.invalid_transition("triage"));
                }
                Ok(vec![EncounterEvent::PatientTriaged { acuity_level }])
            }
            EncounterCommand::Begin { .. } => {
                self.require_exists()?;
                if !matches!(self.stage, EncounterStage::CheckedIn | EncounterStage::Triaged) {
                    return Err(self.invalid_transition("begin"));
                }
                Ok(vec![EncounterEvent::EncounterBegan])
            }
            EncounterCommand::Complete { summary, .. } => {
                self.require_exists()?;
                if self.stage != EncounterStage::InProgress {
                    return Err(self.invalid_transition("complete"));
                }
                Ok(vec![EncounterEvent::EncounterCompleted { summary }])
            }
            EncounterCommand::Reopen { reason, .. } => {
                self.require_exists()?;
                if self.stage != EncounterStage::Completed {
                    return Err(self.invalid_transition("reopen"));
                }
                Ok(vec![EncounterEvent::EncounterReopened { reason }])
            }
            EncounterCommand::Discharge { disposition, .. } => {
                self.require_exists()?;
                if self.stage != EncounterStage::Completed {
                    return Err(self.invalid_transition("discharge"));
                }
                Ok(vec![EncounterEvent::PatientDischarged { disposition }])
            }
        }
    }

    fn apply(mut self, event: &EncounterEvent) -> Self {
        match event {
            EncounterEvent::PatientCheckedIn {
                patient_id,
                practitioner_id,
            } => {
                self.stage = EncounterStage::CheckedIn;
                self.patient_id = Some(*patient_id);
                self.practitioner_id = Some(*practitioner_id);
            }
            EncounterEvent::PatientTriaged { .. } => {
                self.stage = EncounterStage::Triaged;
            }
            EncounterEvent::EncounterBegan => {
                self.stage = EncounterStage::InProgress;
            }
            EncounterEvent::EncounterCompleted { .. } => {
                self.stage = EncounterStage::Completed;
            }
            EncounterEvent::EncounterReopened { .. } => {
                self.stage = EncounterStage::InProgress;
                self.reopen_count += 1;
            }
            EncounterEvent::PatientDischarged { .. } => {
                self.stage = EncounterStage::Discharged;
            }
        }
        self
    }

    fn admits(&self, event: &EncounterEvent) -> bool {
        match event {
            EncounterEvent::PatientCheckedIn { .. } => self.stage == EncounterStage::NotStarted,
            EncounterEvent::PatientTriaged { .. } => self.stage == EncounterStage::CheckedIn,
            EncounterEvent::EncounterBegan => {
                matches!(self.stage, EncounterStage::CheckedIn | EncounterStage::Triaged)
            }
            EncounterEvent::EncounterCompleted { .. } => self.stage == EncounterStage::InProgress,
            EncounterEvent::EncounterReopened { .. } => self.stage == EncounterStage::Completed,
            EncounterEvent::PatientDischarged { .. } => self.stage == EncounterStage::Completed,
        }
    }

    fn occurred_at(cmd: &EncounterCommand) -> DateTime<FixedOffset> {
        match cmd {
            EncounterCommand::CheckIn { occurred_at, .. }
            | EncounterCommand::Triage { occurred_at, .. }
            | EncounterCommand::Begin { occurred_at }
            | EncounterCommand::Complete { occurred_at, .. }
            | EncounterCommand::Reopen { occurred_at, .. }
            | EncounterCommand::Discharge { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Encounter {
    fn require_exists(&self) -> Result<(), DomainError> {
        if self.stage == EncounterStage::NotStarted {
            return Err(DomainError::new(
                InvariantCode::EP2,
                "encounter does not exist",
            ));
        }
        Ok(())
    }

    fn invalid_transition(&self, attempted: &str) -> DomainError {
        DomainError::new(
            InvariantCode::EP1,
            format!("cannot {attempted} from stage {:?}", self.stage),
        )
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

    fn step(state: Encounter, cmd: EncounterCommand) -> Encounter {
        let events = state.decide(cmd, &clock()).expect("command should succeed");
        events.iter().fold(state, |s, e| s.apply(e))
    }

    fn checked_in() -> Encounter {
        step(
            Encounter::default(),
            EncounterCommand::CheckIn {
                patient_id: Uuid::new_v4(),
                practitioner_id: Uuid::new_v4(),
                occurred_at: at(),
            },
        )
    }

    #[test]
    fn full_happy_path() {
        let e = checked_in();
        let e = step(e, EncounterCommand::Triage { acuity_level: 3, occurred_at: at() });
        let e = step(e, EncounterCommand::Begin { occurred_at: at() });
        let e = step(
            e,
            EncounterCommand::Complete { summary: "seen and treated".into(), occurred_at: at() },
        );
        let e = step(
            e,
            EncounterCommand::Discharge { disposition: "home".into(), occurred_at: at() },
        );
        assert_eq!(e.stage, EncounterStage::Discharged);
    }

    #[test]
    fn triage_is_optional() {
        let e = checked_in();
        let e = step(e, EncounterCommand::Begin { occurred_at: at() });
        assert_eq!(e.stage, EncounterStage::InProgress);
    }

    #[test]
    fn reopen_returns_to_in_progress() {
        let e = checked_in();
        let e = step(e, EncounterCommand::Begin { occurred_at: at() });
        let e = step(
            e,
            EncounterCommand::Complete { summary: "done".into(), occurred_at: at() },
        );
        let e = step(
            e,
            EncounterCommand::Reopen { reason: "addendum needed".into(), occurred_at: at() },
        );
        assert_eq!(e.stage, EncounterStage::InProgress);
        assert_eq!(e.reopen_count, 1);

        // And it can be completed again.
        let e = step(
            e,
            EncounterCommand::Complete { summary: "amended".into(), occurred_at: at() },
        );
        assert_eq!(e.stage, EncounterStage::Completed);
    }

    #[test]
    fn commands_on_missing_encounter_rejected_ep2() {
        let err = Encounter::default()
            .decide(EncounterCommand::Begin { occurred_at: at() }, &clock())
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::EP2);
    }

    #[test]
    fn double_check_in_rejected_ep1() {
        let e = checked_in();
        let err = e
            .decide(
                EncounterCommand::CheckIn {
                    patient_id: Uuid::new_v4(),
                    practitioner_id: Uuid::new_v4(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::EP1);
    }

    #[test]
    fn triage_after_begin_rejected_ep1() {
        let e = checked_in();
        let e = step(e, EncounterCommand::Begin { occurred_at: at() });
        let err = e
            .decide(
                EncounterCommand::Triage { acuity_level: 2, occurred_at: at() },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::EP1);
    }

    #[test]
    fn complete_before_begin_rejected_ep1() {
        let e = checked_in();
        let err = e
            .decide(
                EncounterCommand::Complete { summary: "too early".into(), occurred_at: at() },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::EP1);
    }

    #[test]
    fn discharge_requires_completed_ep1() {
        let e = checked_in();
        let e = step(e, EncounterCommand::Begin { occurred_at: at() });
        let err = e
            .decide(
                EncounterCommand::Discharge { disposition: "home".into(), occurred_at: at() },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::EP1);
    }

    #[test]
    fn discharged_is_terminal() {
        let e = checked_in();
        let e = step(e, EncounterCommand::Begin { occurred_at: at() });
        let e = step(
            e,
            EncounterCommand::Complete { summary: "done".into(), occurred_at: at() },
        );
        let e = step(
            e,
            EncounterCommand::Discharge { disposition: "home".into(), occurred_at: at() },
        );
        for cmd in [
            EncounterCommand::Begin { occurred_at: at() },
            EncounterCommand::Reopen { reason: "late".into(), occurred_at: at() },
            EncounterCommand::Complete { summary: "again".into(), occurred_at: at() },
        ] {
            let err = e.decide(cmd, &clock()).unwrap_err();
            assert_eq!(err.code, InvariantCode::EP1);
        }
    }

    #[test]
    fn admits_mirrors_decide() {
        // Scenario from the sync conflict tests: from CheckedIn, Began is
        // admitted; after Began, Triaged is not.
        let e = checked_in();
        assert!(e.admits(&EncounterEvent::EncounterBegan));
        let e = e.apply(&EncounterEvent::EncounterBegan);
        assert!(!e.admits(&EncounterEvent::PatientTriaged { acuity_level: 3 }));
        assert!(e.admits(&EncounterEvent::EncounterCompleted { summary: "x".into() }));
    }
}
