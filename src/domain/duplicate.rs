//! Duplicate resolution aggregate.
//!
//! Tracks a suspected duplicate pair of patient registrations from flagging
//! to a terminal resolution. The resolution records the decision; the
//! registrations themselves are untouched here, and any merge is carried
//! out by follow-up commands on the registrations.

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
pub enum DuplicateState {
    #[default]
    NotFlagged,
    Flagged,
    Resolved,
}

/// The reviewer's verdict on a flagged pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateDecision {
    /// The records describe the same person; the duplicate folds into the
    /// primary.
    Merged,
    /// The records describe distinct people.
    Distinct,
}

/// A suspected duplicate patient pair under review.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DuplicateResolution {
    pub state: DuplicateState,
    pub primary_patient_id: Option<Uuid>,
    pub duplicate_patient_id: Option<Uuid>,
    pub decision: Option<DuplicateDecision>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DuplicateCommand {
    Flag {
        primary_patient_id: Uuid,
        duplicate_patient_id: Uuid,
        reason: String,
        occurred_at: DateTime<FixedOffset>,
    },
    Resolve {
        decision: DuplicateDecision,
        occurred_at: DateTime<FixedOffset>,
    },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DuplicateEvent {
    DuplicateFlagged {
        primary_patient_id: Uuid,
        duplicate_patient_id: Uuid,
        reason: String,
    },
    DuplicateResolved {
        decision: DuplicateDecision,
    },
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for DuplicateResolution {
    const KIND: AggregateKind = AggregateKind::DuplicateResolution;
    const EVENT_NAMESPACE: &'static str = "clinical.identity";
    type Command = DuplicateCommand;
    type DomainEvent = DuplicateEvent;

    fn decide(
        &self,
        cmd: DuplicateCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<DuplicateEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        match cmd {
            DuplicateCommand::Flag {
                primary_patient_id,
                duplicate_patient_id,
                reason,
                ..
            } => {
                if self.state != DuplicateState::NotFlagged {
                    return Err(DomainError::new(
                        InvariantCode::CA1,
                        "duplicate pair is already flagged",
                    ));
                }
                if primary_patient_id == duplicate_patient_id {
                    return Err(DomainError::new(
                        InvariantCode::CA1,
                        "a registration cannot duplicate itself",
                    ));
                }
                Ok(vec![DuplicateEvent::DuplicateFlagged {
                    primary_patient_id,
                    duplicate_patient_id,
                    reason,
                }])
            }
            DuplicateCommand::Resolve { decision, .. } => match self.state {
                DuplicateState::NotFlagged => Err(DomainError::new(
                    InvariantCode::CA4,
                    "duplicate pair was never flagged",
                )),
                DuplicateState::Resolved => Err(DomainError::new(
                    InvariantCode::CA2,
                    "duplicate pair is already resolved",
                )),
                DuplicateState::Flagged => Ok(vec![DuplicateEvent::DuplicateResolved { decision }]),
            },
        }
    }

    fn apply(mut self, event: &DuplicateEvent) -> Self {
        match event {
            DuplicateEvent::DuplicateFlagged {
                primary_patient_id,
                duplicate_patient_id,
                ..
            } => {
                self.state = DuplicateState::Flagged;
                self.primary_patient_id = Some(*primary_patient_id);
                self.duplicate_patient_id = Some(*duplicate_patient_id);
            }
            DuplicateEvent::DuplicateResolved { decision } => {
                self.state = DuplicateState::Resolved;
                self.decision = Some(*decision);
            }
        }
        self
    }

    fn admits(&self, event: &DuplicateEvent) -> bool {
        match event {
            DuplicateEvent::DuplicateFlagged { .. } => self.state == DuplicateState::NotFlagged,
            DuplicateEvent::DuplicateResolved { .. } => self.state == DuplicateState::Flagged,
        }
    }

    fn occurred_at(cmd: &DuplicateCommand) -> DateTime<FixedOffset> {
        match cmd {
            DuplicateCommand::Flag { occurred_at, .. }
            | DuplicateCommand::Resolve { occurred_at, .. } => *occurred_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
