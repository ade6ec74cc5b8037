//! Clinical note aggregate.
//!
//! Notes are authored once, may accumulate addenda, and may be cosigned at
//! most once by a clinician other than the original author.

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

/// A clinical note with its addenda and cosignature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClinicalNote {
    pub authored: bool,
    pub author_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub encounter_id: Option<Uuid>,
    pub addendum_count: u32,
    pub cosigned_by: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum NoteCommand {
    Author {
        patient_id: Uuid,
        encounter_id: Uuid,
        author_id: Uuid,
        body: String,
        occurred_at: DateTime<FixedOffset>,
    },
    AppendAddendum {
        author_id: Uuid,
        body: String,
        occurred_at: DateTime<FixedOffset>,
    },
    Cosign {
        cosigner_id: Uuid,
        occurred_at: DateTime<FixedOffset>,
    },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum NoteEvent {
    ClinicalNoteAuthored {
        patient_id: Uuid,
        encounter_id: Uuid,
        author_id: Uuid,
        body: String,
    },
    NoteAddendumAppended {
        author_id: Uuid,
        body: String,
    },
    ClinicalNoteCosigned {
        cosigner_id: Uuid,
    },
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for ClinicalNote {
    const KIND: AggregateKind = AggregateKind::ClinicalNote;
    const EVENT_NAMESPACE: &'static str = "clinical.documentation";
    type Command = NoteCommand;
    type DomainEvent = NoteEvent;

    fn decide(&self, cmd: NoteCommand, clock: &dyn Clock) -> Result<Vec<NoteEvent>, DomainError> {
        guard_occurred_at(Self::occurred_at(&cmd), clock)?;
        match cmd {
            NoteCommand::Author {
                patient_id,
                encounter_id,
                author_id,
                body,
                ..
            } => {
                if self.authored {
                    return Err(DomainError::new(
                        InvariantCode::CD1,
                        "note is already authored",
                    ));
                }
                Ok(vec![NoteEvent::ClinicalNoteAuthored {
                    patient_id,
                    encounter_id,
                    author_id,
                    body,
                }])
            }
            NoteCommand::AppendAddendum { author_id, body, .. } => {
                if !self.authored {
                    return Err(DomainError::new(InvariantCode::CD1, "note does not exist"));
                }
                Ok(vec![NoteEvent::NoteAddendumAppended { author_id, body }])
            }
            NoteCommand::Cosign { cosigner_id, .. } => {
                if !self.authored {
                    return Err(DomainError::new(InvariantCode::CD1, "note does not exist"));
                }
                if self.cosigned_by.is_some() {
                    return Err(DomainError::new(
                        InvariantCode::CD2,
                        "note is already cosigned",
                    ));
                }
                if Some(cosigner_id) == self.author_id {
                    return Err(DomainError::new(
                        InvariantCode::CD3,
                        "a note cannot be cosigned by its author",
                    ));
                }
                Ok(vec![NoteEvent::ClinicalNoteCosigned { cosigner_id }])
            }
        }
    }

    fn apply(mut self, event: &NoteEvent) -> Self {
        match event {
            NoteEvent::ClinicalNoteAuthored {
                patient_id,
                encounter_id,
                author_id,
                ..
            } => {
                self.authored = true;
                self.patient_id = Some(*patient_id);
                self.encounter_id = Some(*encounter_id);
                self.author_id = Some(*author_id);
            }
            NoteEvent::NoteAddendumAppended { .. } => {
                self.addendum_count += 1;
            }
            NoteEvent::ClinicalNoteCosigned { cosigner_id } => {
                self.cosigned_by = Some(*cosigner_id);
            }
        }
        self
    }

    fn admits(&self, event: &NoteEvent) -> bool {
        match event {
            NoteEvent::ClinicalNoteAuthored { .. } => !self.authored,
            NoteEvent::NoteAddendumAppended { .. } => self.authored,
            NoteEvent::ClinicalNoteCosigned { cosigner_id } => {
                self.authored && self.cosigned_by.is_none() && Some(*cosigner_id) != self.author_id
            }
        }
    }

    fn occurred_at(cmd: &NoteCommand) -> DateTime<FixedOffset> {
        match cmd {
            NoteCommand::Author { occurred_at, .. }
            | NoteCommand::AppendAddendum { occurred_at, .. }
            | NoteCommand::Cosign { occurred_at, .. } => *occurred_at,
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

    fn authored_by(author: Uuid) -> ClinicalNote {
        let events = ClinicalNote::default()
            .decide(
                NoteCommand::Author {
                    patient_id: Uuid::new_v4(),
                    encounter_id: Uuid::new_v4(),
                    author_id: author,
                    body: "chief complaint: headache".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .expect("author should succeed");
        events.iter().fold(ClinicalNote::default(), |s, e| s.apply(e))
    }

    #[test]
    fn author_addendum_cosign() {
        let author = Uuid::new_v4();
        let cosigner = Uuid::new_v4();
        let n = authored_by(author);
        let events = n
            .decide(
                NoteCommand::AppendAddendum {
                    author_id: author,
                    body: "patient called back".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .expect("addendum should succeed");
        let n = events.iter().fold(n, |s, e| s.apply(e));
        assert_eq!(n.addendum_count, 1);

        let events = n
            .decide(
                NoteCommand::Cosign { cosigner_id: cosigner, occurred_at: at() },
                &clock(),
            )
            .expect("cosign should succeed");
        let n = events.iter().fold(n, |s, e| s.apply(e));
        assert_eq!(n.cosigned_by, Some(cosigner));
    }

    #[test]
    fn self_cosign_rejected_cd3() {
        let author = Uuid::new_v4();
        let n = authored_by(author);
        let err = n
            .decide(
                NoteCommand::Cosign { cosigner_id: author, occurred_at: at() },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::CD3);
    }

    #[test]
    fn second_cosign_rejected_cd2() {
        let author = Uuid::new_v4();
        let n = authored_by(author);
        let n = n.apply(&NoteEvent::ClinicalNoteCosigned { cosigner_id: Uuid::new_v4() });
        let err = n
            .decide(
                NoteCommand::Cosign { cosigner_id: Uuid::new_v4(), occurred_at: at() },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::CD2);
    }

    #[test]
    fn addendum_before_author_rejected_cd1() {
        let err = ClinicalNote::default()
            .decide(
                NoteCommand::AppendAddendum {
                    author_id: Uuid::new_v4(),
                    body: "early".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::CD1);
    }

    #[test]
    fn double_author_rejected_cd1() {
        let author = Uuid::new_v4();
        let n = authored_by(author);
        let err = n
            .decide(
                NoteCommand::Author {
                    patient_id: Uuid::new_v4(),
                    encounter_id: Uuid::new_v4(),
                    author_id: author,
                    body: "again".into(),
                    occurred_at: at(),
                },
                &clock(),
            )
            .unwrap_err();
        assert_eq!(err.code, InvariantCode::CD1);
    }
}
