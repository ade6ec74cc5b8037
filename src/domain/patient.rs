//! Patient registration aggregate.
//!
//! A registration moves from Active to exactly one terminal state, Deceased
//! or TransferredOut. While Active it accepts identity corrections and
//! contact declarations, which record facts without changing the lifecycle
//! stage.

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{Aggregate, DomainError, guard_occurred_at};
use crate::clock::Clock;
use crate::envelope::AggregateKind;
use crate::invariant::InvariantCode;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle stages of a patient registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PatientLifecycle {
    #[default]
    NotRegistered,
    Active,
    Deceased,
    TransferredOut,
}

impl PatientLifecycle {
    /// Deceased and transferred-out registrations accept no further
    /// lifecycle transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deceased | Self::TransferredOut)
    }
}

/// A patient registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientRegistration {
    pub lifecycle: PatientLifecycle,
    pub given_name: String,
    pub family_name: String,
    pub date_of_birth: Option<NaiveDate>,
    /// Number of identity corrections applied while active.
    pub correction_count: u32,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands accepted by the [`PatientRegistration`] aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PatientCommand {
    Register {
        given_name: String,
        family_name: String,
        date_of_birth: NaiveDate,
        occurred_at: DateTime<FixedOffset>,
    },
    CorrectIdentity {
        given_name: String,
        family_name: String,
        date_of_birth: NaiveDate,
        reason: String,
        occurred_at: DateTime<FixedOffset>,
    },
    DeclareContactInfo {
        phone: Option<String>,
        email: Option<String>,
        address: Option<String>,
        occurred_at: DateTime<FixedOffset>,
    },
    RecordDeceased {
        occurred_at: DateTime<FixedOffset>,
    },
    TransferOut {
        destination: String,
        occurred_at: DateTime<FixedOffset>,
    },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Domain events produced by the [`PatientRegistration`] aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PatientEvent {
    PatientRegistered {
        given_name: String,
        family_name: String,
        date_of_birth: NaiveDate,
    },
    PatientIdentityCorrected {
        given_name: String,
        family_name: String,
        date_of_birth: NaiveDate,
        reason: String,
    },
    ContactInfoDeclared {
        phone: Option<String>,
        email: Option<String>,
        address: Option<String>,
    },
    PatientDeceasedRecorded,
    PatientTransferredOut {
        destination: String,
    },
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for PatientRegistration {
    const KIND: AggregateKind = AggregateKind::PatientRegistration;
    const EVENT_NAMESPACE: &'static str = "clinical.patient";
    type Command = PatientCommand;
    type DomainEvent = PatientEvent;

    fn decide(
        &self,
        cmd: PatientCommand,
        clock: &dyn Clock,
    ) -> Result<Vec<PatientEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        match cmd {
            PatientCommand::Register {
                given_name,
                family_name,
                date_of_birth,
                ..
            } => {
                if self.lifecycle != PatientLifecycle::NotRegistered {
                    return Err(DomainError::new(
                        InvariantCode::PL1,
                        "patient is already registered",
                    ));
                }
                Ok(vec![PatientEvent::PatientRegistered {
                    given_name,
                    family_name,
                    date_of_birth,
                }])
            }
            PatientCommand::CorrectIdentity {
                given_name,
                family_name,
                date_of_birth,
                reason,
                ..
            } => {
                self.require_active()?;
                Ok(vec![PatientEvent::PatientIdentityCorrected {
                    given_name,
                    family_name,
                    date_of_birth,
                    reason,
                }])
            }
            PatientCommand::DeclareContactInfo {
                phone,
                email,
                address,
                ..
            } => {
                self.require_active()?;
                Ok(vec![PatientEvent::ContactInfoDeclared {
                    phone,
                    email,
                    address,
                }])
            }
            PatientCommand::RecordDeceased { .. } => {
                self.require_transitionable()?;
                Ok(vec![PatientEvent::PatientDeceasedRecorded])
            }
            PatientCommand::TransferOut { destination, .. } => {
                self.require_transitionable()?;
                Ok(vec![PatientEvent::PatientTransferredOut { destination }])
            }
        }
    }

    fn apply(mut self, event: &PatientEvent) -> Self {
        match event {
            PatientEvent::PatientRegistered {
                given_name,
                family_name,
                date_of_birth,
            } => {
                self.lifecycle = PatientLifecycle::Active;
                self.given_name = given_name.clone();
                self.family_name = family_name.clone();
                self.date_of_birth = Some(*date_of_birth);
            }
            PatientEvent::PatientIdentityCorrected {
                given_name,
                family_name,
                date_of_birth,
                ..
            } => {
                self.given_name = given_name.clone();
                self.family_name = family_name.clone();
                self.date_of_birth = Some(*date_of_birth);
                self.correction_count += 1;
            }
            PatientEvent::ContactInfoDeclared { .. } => {}
            PatientEvent::PatientDeceasedRecorded => {
                self.lifecycle = PatientLifecycle::Deceased;
            }
            PatientEvent::PatientTransferredOut { .. } => {
                self.lifecycle = PatientLifecycle::TransferredOut;
            }
        }
        self
    }

    fn admits(&self, event: &PatientEvent) -> bool {
        match event {
            PatientEvent::PatientRegistered { .. } => {
                self.lifecycle == PatientLifecycle::NotRegistered
            }
            PatientEvent::PatientIdentityCorrected { .. }
            | PatientEvent::ContactInfoDeclared { .. }
            | PatientEvent::PatientDeceasedRecorded
            | PatientEvent::PatientTransferredOut { .. } => {
                self.lifecycle == PatientLifecycle::Active
            }
        }
    }

    fn occurred_at(cmd: &PatientCommand) -> DateTime<FixedOffset> {
        match cmd {
            PatientCommand::Register { occurred_at, .. }
            | PatientCommand::CorrectIdentity { occurred_at, .. }
            | PatientCommand::DeclareContactInfo { occurred_at, .. }
            | PatientCommand::RecordDeceased { occurred_at }
            | PatientCommand::TransferOut { occurred_at, .. } => *occurred_at,
        }
    }
}

impl PatientRegistration {
    /// The patient id referenced by declarations is the aggregate id; this
    /// helper gates the non-transitioning commands.
    fn require_active(&self) -> Result<(), DomainError> {
        match self.lifecycle {
            PatientLifecycle::NotRegistered => Err(DomainError::new(
                InvariantCode::PL3,
                "patient is not registered",
            )),
            PatientLifecycle::Active => Ok(()),
            PatientLifecycle::Deceased | PatientLifecycle::TransferredOut => Err(
                DomainError::new(InvariantCode::PL2, "patient registration is terminal"),
            ),
        }
    }

    fn require_transitionable(&self) -> Result<(), DomainError> {
        match self.lifecycle {
            PatientLifecycle::NotRegistered => Err(DomainError::new(
                InvariantCode::PL3,
                "patient is not registered",
            )),
            PatientLifecycle::Active => Ok(()),
            PatientLifecycle::Deceased | PatientLifecycle::TransferredOut => Err(
                DomainError::new(InvariantCode::PL5, "patient registration is already terminal"),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
