//! Allergy record aggregate: identified once, refuted terminally.

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
pub enum AllergyState {
    #[default]
    NotIdentified,
    Identified,
    Refuted,
}

/// A recorded allergy or intolerance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllergyRecord {
    pub state: AllergyState,
    pub patient_id: Option<Uuid>,
    pub substance: String,
    pub reaction: String,
    pub severity: String,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AllergyCommand {
    Identify {
        patient_id: Uuid,
        substance: String,
        reaction: String,
        severity: String,
        occurred_at: DateTime<FixedOffset>,
    },
    Refute {
        reason: String,
        occurred_at: DateTime<FixedOffset>,
    },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AllergyEvent {
    AllergyIdentified {
        patient_id: Uuid,
        substance: String,
        reaction: String,
        severity: String,
    },
    AllergyRefuted {
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for AllergyRecord {
    const KIND: AggregateKind = AggregateKind::AllergyRecord;
    const EVENT_NAMESPACE: &'static str = "clinical.allergy";
    type Command = AllergyCommand;
    type DomainEvent = AllergyEvent;

    fn decide(
        &self,
        cmd: AllergyCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<AllergyEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        match cmd {
            AllergyCommand::Identify {
                patient_id,
                substance,
                reaction,
                severity,
                ..
            } => match self.state {
                AllergyState::NotIdentified => Ok(vec![AllergyEvent::AllergyIdentified {
                    patient_id,
                    substance,
                    reaction,
                    severity,
                }]),
                AllergyState::Identified => Err(DomainError::new(
                    InvariantCode::CA1,
                    "allergy is already identified",
                )),
                AllergyState::Refuted => Err(DomainError::new(
                    InvariantCode::CA2,
                    "refuted allergy record is terminal",
                )),
            },
            AllergyCommand::Refute { reason, .. } => match self.state {
                AllergyState::NotIdentified => Err(DomainError::new(
                    InvariantCode::CA4,
                    "allergy record does not exist",
                )),
                AllergyState::Identified => Ok(vec![AllergyEvent::AllergyRefuted { reason }]),
                AllergyState::Refuted => Err(DomainError::new(
                    InvariantCode::CA2,
                    "allergy is already refuted",
                )),
            },
        }
    }

    fn apply(mut self, event: &AllergyEvent) -> Self {
        match event {
            AllergyEvent::AllergyIdentified {
                patient_id,
                substance,
                reaction,
                severity,
            } => {
                self.state = AllergyState::Identified;
                self.patient_id = Some(*patient_id);
                self.substance = substance.clone();
                self.reaction = reaction.clone();
                self.severity = severity.clone();
            }
            AllergyEvent::AllergyRefuted { .. } => {
                self.state = AllergyState::Refuted;
            }
        }
        self
    }

    fn admits(&self, event: &AllergyEvent) -> bool {
        match event {
            AllergyEvent::AllergyIdentified { .. } => self.state == AllergyState::NotIdentified,
            AllergyEvent::AllergyRefuted { .. } => self.state == AllergyState::Identified,
        }
    }

    fn occurred_at(cmd: &AllergyCommand) -> DateTime<FixedOffset> {
        match cmd {
            AllergyCommand::Identify { occurred_at, .. }
            | AllergyCommand::Refute { occurred_at, .. } => *occurred_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
