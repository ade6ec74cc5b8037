//! End-to-end clinical command flow on a single node: gateway → handler →
//! store → dispatcher → read models, plus the intra-aggregate rejection
//! scenarios that must surface their invariant codes to the caller.

use std::sync::Arc;

use chartsync::domain::{DiagnosisCommand, EncounterCommand, NoteCommand, PatientCommand};
use chartsync::{
    Aggregate, AggregateKind, ClinicalCommand, ClinicalCore, CommandContext, CommandOutcome,
    CommandRequest, ConnectionStatus, FixedClock, InvariantCode, PerformerRole, QueryRequest,
};
use chrono::{DateTime, FixedOffset, NaiveDate};
use uuid::Uuid;

fn instant(s: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(s).expect("valid rfc3339")
}

fn at() -> DateTime<FixedOffset> {
    instant("2026-03-01T08:55:00+00:00")
}

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::at(instant("2026-03-01T09:00:00+00:00")))
}

fn core() -> ClinicalCore {
    ClinicalCore::builder("tablet-1", Uuid::new_v4())
        .clock(clock())
        .build()
}

fn ctx_for(actor: Uuid) -> CommandContext {
    CommandContext::new(
        actor,
        PerformerRole::Physician,
        Uuid::new_v4(),
        Uuid::new_v4(),
        "tablet-1",
        ConnectionStatus::Online,
    )
}

async fn exec(core: &ClinicalCore, command: ClinicalCommand, actor: Uuid) -> CommandOutcome {
    core.execute(command, &ctx_for(actor)).await
}

async fn must(core: &ClinicalCore, command: ClinicalCommand, actor: Uuid) {
    let outcome = exec(core, command, actor).await;
    assert!(outcome.is_success(), "command failed: {outcome:?}");
}

async fn registered_patient(core: &ClinicalCore) -> Uuid {
    let patient_id = Uuid::new_v4();
    must(
        core,
        ClinicalCommand::Patient {
            patient_id,
            command: PatientCommand::Register {
                given_name: "Ada".into(),
                family_name: "Osei".into(),
                date_of_birth: NaiveDate::from_ymd_opt(1980, 5, 17).expect("valid date"),
                occurred_at: at(),
            },
        },
        Uuid::new_v4(),
    )
    .await;
    patient_id
}

async fn active_encounter(core: &ClinicalCore, patient_id: Uuid, practitioner_id: Uuid) -> Uuid {
    let encounter_id = Uuid::new_v4();
    must(
        core,
        ClinicalCommand::Encounter {
            encounter_id,
            command: EncounterCommand::CheckIn {
                patient_id,
                practitioner_id,
                occurred_at: at(),
            },
        },
        practitioner_id,
    )
    .await;
    must(
        core,
        ClinicalCommand::Encounter {
            encounter_id,
            command: EncounterCommand::Begin { occurred_at: at() },
        },
        practitioner_id,
    )
    .await;
    encounter_id
}

#[tokio::test]
async fn full_visit_produces_a_consistent_event_log() {
    let core = core();
    let practitioner = Uuid::new_v4();
    let patient = registered_patient(&core).await;
    let encounter = active_encounter(&core, patient, practitioner).await;

    let diagnosis = Uuid::new_v4();
    must(
        &core,
        ClinicalCommand::Diagnosis {
            diagnosis_id: diagnosis,
            command: DiagnosisCommand::Make {
                patient_id: patient,
                encounter_id: encounter,
                condition: "acute otitis media".into(),
                icd_code: "H66.90".into(),
                occurred_at: at(),
            },
        },
        practitioner,
    )
    .await;

    must(
        &core,
        ClinicalCommand::Encounter {
            encounter_id: encounter,
            command: EncounterCommand::Complete {
                summary: "seen, treated, advised".into(),
                occurred_at: at(),
            },
        },
        practitioner,
    )
    .await;

    // Every stream versions from 1 with no gaps.
    let store = core.store();
    for (kind, id, expected_len) in [
        (AggregateKind::PatientRegistration, patient, 1u64),
        (AggregateKind::Encounter, encounter, 3),
        (AggregateKind::Diagnosis, diagnosis, 1),
    ] {
        let stream = store.read_stream(kind, id);
        assert_eq!(stream.len() as u64, expected_len);
        for (index, envelope) in stream.iter().enumerate() {
            assert_eq!(envelope.aggregate_version(), index as u64 + 1);
        }
    }

    // The device LSN is strictly increasing across all of it.
    let all = store.read_all();
    let mut lsns: Vec<u64> = all.iter().map(|e| e.metadata.local_sequence_number).collect();
    let sorted = {
        let mut s = lsns.clone();
        s.sort_unstable();
        s
    };
    assert_eq!(lsns.len(), 5);
    lsns.dedup();
    assert_eq!(lsns.len(), 5, "no LSN is ever reused");
    assert_eq!(sorted.first(), Some(&1));

    // Read models agree with the streams.
    assert_eq!(
        core.models().encounter_state(encounter),
        Some(chartsync::EncounterState::Completed)
    );
    assert_eq!(
        core.models().diagnosis_status(diagnosis),
        Some(chartsync::DiagnosisStatus::Made)
    );
}

// Scenario: revising a resolved diagnosis must be refused with INV-CJ-3
// and leave no trace in the stream.
#[tokio::test]
async fn diagnosis_revision_after_resolution_rejected() {
    let core = core();
    let practitioner = Uuid::new_v4();
    let patient = registered_patient(&core).await;
    let encounter = active_encounter(&core, patient, practitioner).await;

    let diagnosis = Uuid::new_v4();
    must(
        &core,
        ClinicalCommand::Diagnosis {
            diagnosis_id: diagnosis,
            command: DiagnosisCommand::Make {
                patient_id: patient,
                encounter_id: encounter,
                condition: "acute otitis media".into(),
                icd_code: "H66.90".into(),
                occurred_at: at(),
            },
        },
        practitioner,
    )
    .await;
    must(
        &core,
        ClinicalCommand::Diagnosis {
            diagnosis_id: diagnosis,
            command: DiagnosisCommand::Resolve {
                outcome: "cleared".into(),
                occurred_at: at(),
            },
        },
        practitioner,
    )
    .await;

    let outcome = exec(
        &core,
        ClinicalCommand::Diagnosis {
            diagnosis_id: diagnosis,
            command: DiagnosisCommand::Revise {
                condition: "chronic otitis media".into(),
                icd_code: "H66.3X9".into(),
                reason: "too late".into(),
                occurred_at: at(),
            },
        },
        practitioner,
    )
    .await;

    match outcome {
        CommandOutcome::DomainError { code, .. } => assert_eq!(code, InvariantCode::CJ3),
        other => panic!("expected domain error, got {other:?}"),
    }
    assert_eq!(
        core.store().read_stream(AggregateKind::Diagnosis, diagnosis).len(),
        2,
        "no event may be emitted by the rejected revision"
    );
}

// Scenario: a clinician cannot cosign their own note (INV-CD-3).
#[tokio::test]
async fn self_cosign_is_forbidden() {
    let core = core();
    let author = Uuid::new_v4();
    let patient = registered_patient(&core).await;
    let encounter = active_encounter(&core, patient, author).await;

    let note_id = Uuid::new_v4();
    must(
        &core,
        ClinicalCommand::Note {
            note_id,
            command: NoteCommand::Author {
                patient_id: patient,
                encounter_id: encounter,
                author_id: author,
                body: "assessment and plan".into(),
                occurred_at: at(),
            },
        },
        author,
    )
    .await;

    let outcome = exec(
        &core,
        ClinicalCommand::Note {
            note_id,
            command: NoteCommand::Cosign {
                cosigner_id: author,
                occurred_at: at(),
            },
        },
        author,
    )
    .await;
    match outcome {
        CommandOutcome::DomainError { code, .. } => assert_eq!(code, InvariantCode::CD3),
        other => panic!("expected domain error, got {other:?}"),
    }

    // A different clinician may cosign.
    let cosigner = Uuid::new_v4();
    must(
        &core,
        ClinicalCommand::Note {
            note_id,
            command: NoteCommand::Cosign {
                cosigner_id: cosigner,
                occurred_at: at(),
            },
        },
        cosigner,
    )
    .await;
}

#[tokio::test]
async fn wire_round_trip_through_both_gateways() {
    let core = core();
    let patient_id = Uuid::new_v4();
    let actor = Uuid::new_v4();
    let org = core.organization_id();

    let payload = serde_json::json!({
        "patient_id": patient_id.to_string(),
        "given_name": "Kwame",
        "family_name": "Boateng",
        "date_of_birth": "1975-11-02",
        "occurred_at": "2026-03-01T08:55:00+00:00",
        "performed_by": actor.to_string(),
        "performer_role": "front_desk",
        "organization_id": org.to_string(),
        "facility_id": Uuid::new_v4().to_string(),
        "device_id": "tablet-1",
        "connection_status": "online",
    });
    let outcome = core
        .submit(CommandRequest {
            command_type: "RegisterPatient".to_string(),
            payload,
        })
        .await;
    let wire = outcome.to_wire();
    assert_eq!(wire["success"], true);
    let events = wire["events"].as_array().expect("events array");
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0]["metadata"]["event_type"],
        "clinical.patient.PatientRegistered"
    );

    let result = core.query(&QueryRequest {
        query_type: "performer_role".to_string(),
        params: serde_json::json!({ "actor_id": actor.to_string() }),
    });
    assert!(result.success);
    assert_eq!(result.data.expect("data")["role"], "front_desk");
}

#[tokio::test]
async fn rehydrated_state_matches_any_prior_fold_point() {
    let core = core();
    let practitioner = Uuid::new_v4();
    let patient = registered_patient(&core).await;
    let encounter = active_encounter(&core, patient, practitioner).await;
    must(
        &core,
        ClinicalCommand::Encounter {
            encounter_id: encounter,
            command: EncounterCommand::Complete {
                summary: "done".into(),
                occurred_at: at(),
            },
        },
        practitioner,
    )
    .await;

    let stream = core.store().read_stream(AggregateKind::Encounter, encounter);
    // Folding any prefix then the rest equals folding the whole stream.
    for split in 0..=stream.len() {
        let prefix: chartsync::domain::Encounter = chartsync::rehydrate(&stream[..split]);
        let continued = stream[split..]
            .iter()
            .filter_map(chartsync::decode_domain_event::<chartsync::domain::Encounter>)
            .fold(prefix, |state, event| state.apply(&event));
        let whole: chartsync::domain::Encounter = chartsync::rehydrate(&stream);
        assert_eq!(continued, whole);
    }
}
