//! Appointment aggregate.
//!
//! Requested appointments are confirmed by the practice, may be rescheduled
//! while confirmed (remaining confirmed at the new time), and end in one of
//! three terminal states: cancelled by the patient, cancelled by the
//! practice, or marked as a no-show.

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
pub enum AppointmentStage {
    #[default]
    NotRequested,
    Requested,
    Confirmed,
    CancelledByPatient,
    CancelledByPractice,
    NoShowed,
}

impl AppointmentStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CancelledByPatient | Self::CancelledByPractice | Self::NoShowed
        )
    }
}

/// A scheduled appointment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub stage: AppointmentStage,
    pub patient_id: Option<Uuid>,
    pub practitioner_id: Option<Uuid>,
    pub scheduled_for: Option<DateTime<FixedOffset>>,
    pub reschedule_count: u32,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AppointmentCommand {
    Request {
        patient_id: Uuid,
        practitioner_id: Uuid,
        scheduled_for: DateTime<FixedOffset>,
        occurred_at: DateTime<FixedOffset>,
    },
    Confirm {
        occurred_at: DateTime<FixedOffset>,
    },
    Reschedule {
        scheduled_for: DateTime<FixedOffset>,
        occurred_at: DateTime<FixedOffset>,
    },
    CancelByPatient {
        reason: String,
        occurred_at: DateTime<FixedOffset>,
    },
    CancelByPractice {
        reason: String,
        occurred_at: DateTime<FixedOffset>,
    },
    MarkNoShow {
        occurred_at: DateTime<FixedOffset>,
    },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AppointmentEvent {
    AppointmentRequested {
        patient_id: Uuid,
        practitioner_id: Uuid,
        scheduled_for: DateTime<FixedOffset>,
    },
    AppointmentConfirmed,
    AppointmentRescheduled {
        scheduled_for: DateTime<FixedOffset>,
    },
    AppointmentCancelledByPatient {
        reason: String,
    },
    AppointmentCancelledByPractice {
        reason: String,
    },
    AppointmentNoShowed,
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for Appointment {
    const KIND: AggregateKind = AggregateKind::Appointment;
    const EVENT_NAMESPACE: &'static str = "clinical.scheduling";
    type Command = AppointmentCommand;
    type DomainEvent = AppointmentEvent;

    fn decide(
        &self,
        cmd: AppointmentCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<AppointmentEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        if self.stage.is_terminal() {
            return Err(DomainError::new(
                InvariantCode::CA2,
                "appointment is in a terminal state",
            ));
        }
        match cmd {
            AppointmentCommand::Request {
                patient_id,
                practitioner_id,
                scheduled_for,
                ..
            } => {
                if self.stage != AppointmentStage::NotRequested {
                    return Err(DomainError::new(
                        InvariantCode::CA1,
                        "appointment is already requested",
                    ));
                }
                Ok(vec![AppointmentEvent::AppointmentRequested {
                    patient_id,
                    practitioner_id,
                    scheduled_for,
                }])
            }
            AppointmentCommand::Confirm { .. } => {
                self.require_exists()?;
                if self.stage != AppointmentStage::Requested {
                    return Err(DomainError::new(
                        InvariantCode::CA1,
                        "only a requested appointment can be confirmed",
                    ));
                }
                Ok(vec![AppointmentEvent::AppointmentConfirmed])
            }
            AppointmentCommand::Reschedule { scheduled_for, .. } => {
                self.require_exists()?;
                if self.stage != AppointmentStage::Confirmed {
                    return Err(DomainError::new(
                        InvariantCode::CA3,
                        "only a confirmed appointment can be rescheduled",
                    ));
                }
                Ok(vec![AppointmentEvent::AppointmentRescheduled { scheduled_for }])
            }
            AppointmentCommand::CancelByPatient { reason, .. } => {
                self.require_exists()?;
                Ok(vec![AppointmentEvent::AppointmentCancelledByPatient { reason }])
            }
            AppointmentCommand::CancelByPractice { reason, .. } => {
                self.require_exists()?;
                Ok(vec![AppointmentEvent::AppointmentCancelledByPractice { reason }])
            }
            AppointmentCommand::MarkNoShow { .. } => {
                self.require_exists()?;
                if self.stage != AppointmentStage::Confirmed {
                    return Err(DomainError::new(
                        InvariantCode::CA1,
                        "only a confirmed appointment can be marked no-show",
                    ));
                }
                Ok(vec![AppointmentEvent::AppointmentNoShowed])
            }
        }
    }

    fn apply(mut self, event: &AppointmentEvent) -> Self {
        match event {
            AppointmentEvent::AppointmentRequested {
                patient_id,
                practitioner_id,
                scheduled_for,
            } => {
                self.stage = AppointmentStage::Requested;
                self.patient_id = Some(*patient_id);
                self.practitioner_id = Some(*practitioner_id);
                self.scheduled_for = Some(*scheduled_for);
            }
            AppointmentEvent::AppointmentConfirmed => {
                self.stage = AppointmentStage::Confirmed;
            }
            AppointmentEvent::AppointmentRescheduled { scheduled_for } => {
                self.scheduled_for = Some(*scheduled_for);
                self.reschedule_count += 1;
            }
            AppointmentEvent::AppointmentCancelledByPatient { .. } => {
                self.stage = AppointmentStage::CancelledByPatient;
            }
            AppointmentEvent::AppointmentCancelledByPractice { .. } => {
                self.stage = AppointmentStage::CancelledByPractice;
            }
            AppointmentEvent::AppointmentNoShowed => {
                self.stage = AppointmentStage::NoShowed;
            }
        }
        self
    }

    fn admits(&self, event: &AppointmentEvent) -> bool {
        if self.stage.is_terminal() {
            return false;
        }
        match event {
            AppointmentEvent::AppointmentRequested { .. } => {
                self.stage == AppointmentStage::NotRequested
            }
            AppointmentEvent::AppointmentConfirmed => self.stage == AppointmentStage::Requested,
            AppointmentEvent::AppointmentRescheduled { .. } => {
                self.stage == AppointmentStage::Confirmed
            }
            AppointmentEvent::AppointmentCancelledByPatient { .. }
            | AppointmentEvent::AppointmentCancelledByPractice { .. } => {
                matches!(
                    self.stage,
                    AppointmentStage::Requested | AppointmentStage::Confirmed
                )
            }
            AppointmentEvent::AppointmentNoShowed => self.stage == AppointmentStage::Confirmed,
        }
    }

    fn occurred_at(cmd: &AppointmentCommand) -> DateTime<FixedOffset> {
        match cmd {
            AppointmentCommand::Request { occurred_at, .. }
            | AppointmentCommand::Confirm { occurred_at }
            | AppointmentCommand::Reschedule { occurred_at, .. }
            | AppointmentCommand::CancelByPatient { occurred_at, .. }
            | AppointmentCommand::CancelByPractice { occurred_at, .. }
            | AppointmentCommand::MarkNoShow { occurred_at } => *occurred_at,
        }
    }
}

impl Appointment {
    fn require_exists(&self) -> Result<(), DomainError> {
        if self.stage == AppointmentStage::NotRequested {
            return Err(DomainError::new(
                InvariantCode::CA4,
                "appointment does not exist",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
