//! Hub-and-spoke synchronization: the four-phase protocol, conflict
//! resolution by causal replay, and the cursors that make every phase
//! resumable.
//!
//! ## Protocol messages
//!
//! - [`SyncHandshake`] - Device → Hub: identify, report cursors and clock
//! - [`SyncHandshakeAck`] - Hub → Device: admit or refuse, computed drift
//! - [`SyncUpload`] - Device → Hub: one outbox batch in LSN order
//! - [`SyncUploadAck`] - Hub → Device: per-event disposition
//! - [`SyncDownload`] - Hub → Device: events past the device's cursor
//! - [`SyncDownloadAck`] - Device → Hub: cursor advancement
//!
//! Devices never talk to each other; the hub serializes one session per
//! device while distinct devices sync in parallel. Re-running any phase is
//! a no-op: appends are idempotent on event id, outbox pruning is
//! idempotent, and cursors only move forward.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{Aggregate, decode_domain_event};
use crate::causal::causal_order;
use crate::clock::Clock;
use crate::compensation::{CompensationEngine, HubStamp};
use crate::config::CoreConfig;
use crate::device::{DeviceSession, Outbox};
use crate::dispatcher::EventDispatcher;
use crate::domain::{
    AllergyRecord, Appointment, ClinicalNote, Diagnosis, DuplicateResolution, Encounter,
    ExaminationFinding, LabResult, PatientRegistration, Procedure, Referral, Symptom,
    TreatmentPlan, VitalSigns,
};
use crate::envelope::{AggregateKind, Audience, EventEnvelope};
use crate::invariant::InvariantCode;
use crate::readmodel::SharedReadModels;
use crate::store::{AppendOutcome, EventFilter, EventStore, StoreError};

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Device → Hub, phase 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHandshake {
    pub device_id: String,
    pub organization_id: Uuid,
    pub protocol_version: u32,
    pub last_downloaded_position: u64,
    pub device_lsn: u64,
    pub pending_count: u32,
    pub device_clock: DateTime<FixedOffset>,
}

/// Hub verdict on a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStatus {
    Ready,
    DeviceRevoked,
    OrgMismatch,
    ProtocolUnsupported,
}

/// Hub → Device, phase 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHandshakeAck {
    pub status: HandshakeStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hub_clock: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub computed_drift_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hub_current_position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub events_available: Option<u64>,
}

/// Device → Hub, phase 3a.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncUpload {
    pub sync_batch_id: Uuid,
    pub events: Vec<EventEnvelope>,
}

/// Disposition of one conflicted upload after causal re-replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Permissible under replay; appended at this version.
    Accepted { renumbered_to: u64 },
    /// Another event already performed the same transition.
    Duplicate,
    /// Impermissible under replay; preserved as a review item.
    CompensationRequired { invariant_code: InvariantCode },
}

/// One conflicted event and its resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub event_id: Uuid,
    pub resolution: ConflictResolution,
}

/// Hub → Device, phase 3a.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncUploadAck {
    pub accepted: Vec<Uuid>,
    pub duplicate: Vec<Uuid>,
    pub conflicted: Vec<ConflictReport>,
    /// Review items and auto-compensations emitted by this batch.
    pub compensations: Vec<EventEnvelope>,
}

/// Hub → Device, phase 3b. `hub_current_position` is the position this
/// batch reaches; the device acknowledges it as its new cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDownload {
    pub events: Vec<EventEnvelope>,
    pub hub_current_position: u64,
}

/// Device → Hub, phase 3b.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDownloadAck {
    pub received_count: u64,
    pub last_hub_position: u64,
}

// ---------------------------------------------------------------------------
// Hub-side registry and cursors
// ---------------------------------------------------------------------------

/// A device known to the hub.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: String,
    pub organization_id: Uuid,
    pub revoked: bool,
    /// Audience mask applied to downloads; `None` means unrestricted.
    pub visibility: Option<std::collections::BTreeSet<Audience>>,
}

/// Registry of devices allowed to sync.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, record: DeviceRecord) {
        self.devices.insert(record.device_id.clone(), record);
    }

    pub fn revoke(&mut self, device_id: &str) {
        if let Some(record) = self.devices.get_mut(device_id) {
            record.revoked = true;
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceRecord> {
        self.devices.get(device_id)
    }
}

/// Hub-side cursors for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_uploaded_lsn: u64,
    pub last_downloaded_position: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_sync_at: Option<DateTime<FixedOffset>>,
}

// ---------------------------------------------------------------------------
// Conflict resolution by causal replay
// ---------------------------------------------------------------------------

/// Outcome of replaying one incoming event.
#[derive(Debug, Clone, PartialEq)]
enum ReplayOutcome {
    Accepted { version: u64 },
    Duplicate,
    Rejected { code: InvariantCode },
}

/// Result of resolving one contested stream.
struct StreamResolution {
    /// Disposition per incoming event id.
    outcomes: Vec<(Uuid, ReplayOutcome)>,
    /// Events (incoming or displaced) rejected by the state machine, to be
    /// preserved as review items.
    rejected: Vec<(EventEnvelope, InvariantCode)>,
}

/// Invariant code used when replay rejects an event of this kind.
fn replay_rejection_code(kind: AggregateKind) -> InvariantCode {
    match kind {
        AggregateKind::PatientRegistration => InvariantCode::PL5,
        AggregateKind::Encounter => InvariantCode::EP1,
        AggregateKind::Diagnosis => InvariantCode::CJ4,
        AggregateKind::ClinicalNote => InvariantCode::CD1,
        AggregateKind::Appointment => InvariantCode::CA1,
        AggregateKind::AllergyRecord | AggregateKind::DuplicateResolution => InvariantCode::CA1,
        _ => InvariantCode::CO3,
    }
}

/// Replay a contested stream in causal order, renumbering what fits.
///
/// Works for any aggregate kind via the exhaustive dispatch below; the
/// store's stream suffix is rebuilt in place. Deterministic: both hub and
/// device converge by running the same function over the same event set.
fn resolve_stream(
    store: &dyn EventStore,
    kind: AggregateKind,
    aggregate_id: Uuid,
    incoming: Vec<EventEnvelope>,
) -> Result<StreamResolution, StoreError> {
    match kind {
        AggregateKind::PatientRegistration => {
            resolve_typed::<PatientRegistration>(store, aggregate_id, incoming)
        }
        AggregateKind::Encounter => resolve_typed::<Encounter>(store, aggregate_id, incoming),
        AggregateKind::Diagnosis => resolve_typed::<Diagnosis>(store, aggregate_id, incoming),
        AggregateKind::ClinicalNote => resolve_typed::<ClinicalNote>(store, aggregate_id, incoming),
        AggregateKind::Appointment => resolve_typed::<Appointment>(store, aggregate_id, incoming),
        AggregateKind::AllergyRecord => {
            resolve_typed::<AllergyRecord>(store, aggregate_id, incoming)
        }
        AggregateKind::DuplicateResolution => {
            resolve_typed::<DuplicateResolution>(store, aggregate_id, incoming)
        }
        AggregateKind::VitalSigns => resolve_typed::<VitalSigns>(store, aggregate_id, incoming),
        AggregateKind::Symptom => resolve_typed::<Symptom>(store, aggregate_id, incoming),
        AggregateKind::ExaminationFinding => {
            resolve_typed::<ExaminationFinding>(store, aggregate_id, incoming)
        }
        AggregateKind::LabResult => resolve_typed::<LabResult>(store, aggregate_id, incoming),
        AggregateKind::Procedure => resolve_typed::<Procedure>(store, aggregate_id, incoming),
        AggregateKind::Referral => resolve_typed::<Referral>(store, aggregate_id, incoming),
        AggregateKind::TreatmentPlan => {
            resolve_typed::<TreatmentPlan>(store, aggregate_id, incoming)
        }
        // Review streams have no state machine; append in causal order.
        AggregateKind::CompensationReview => {
            resolve_unchecked(store, kind, aggregate_id, incoming)
        }
    }
}

fn resolve_typed<A: Aggregate>(
    store: &dyn EventStore,
    aggregate_id: Uuid,
    incoming: Vec<EventEnvelope>,
) -> Result<StreamResolution, StoreError> {
    let existing = store.read_stream(A::KIND, aggregate_id);
    let incoming_ids: std::collections::HashSet<Uuid> =
        incoming.iter().map(EventEnvelope::event_id).collect();

    let mut all = existing.clone();
    all.extend(incoming.iter().cloned());
    let ordered = match causal_order(&all) {
        Ok(ordered) => ordered,
        Err(violation) => {
            // Recorded causation contradicts stream order. Nothing is
            // appended; every incoming event is preserved for review.
            tracing::warn!(
                aggregate_type = A::KIND.as_str(),
                %aggregate_id,
                involved = violation.involved.len(),
                "causal integrity violation during conflict resolution"
            );
            let code = replay_rejection_code(A::KIND);
            return Ok(StreamResolution {
                outcomes: incoming
                    .iter()
                    .map(|e| (e.event_id(), ReplayOutcome::Rejected { code }))
                    .collect(),
                rejected: incoming.into_iter().map(|e| (e, code)).collect(),
            });
        }
    };

    // Replay from the initial state, renumbering every permissible event.
    let mut state = A::default();
    let mut placed: Vec<EventEnvelope> = Vec::with_capacity(ordered.len());
    let mut outcomes = Vec::new();
    let mut rejected = Vec::new();
    for envelope in ordered {
        let is_incoming = incoming_ids.contains(&envelope.event_id());
        match decode_domain_event::<A>(&envelope) {
            Some(event) if state.admits(&event) => {
                let version = placed.len() as u64 + 1;
                placed.push(envelope.with_aggregate_version(version));
                state = state.apply(&event);
                if is_incoming {
                    outcomes.push((envelope.event_id(), ReplayOutcome::Accepted { version }));
                }
            }
            Some(_) => {
                // Same transition already performed from the same state is
                // a duplicate; anything else is a genuine rejection.
                let same_type_placed = placed
                    .iter()
                    .any(|p| p.event_type() == envelope.event_type());
                if same_type_placed {
                    if is_incoming {
                        outcomes.push((envelope.event_id(), ReplayOutcome::Duplicate));
                    }
                    // Displaced duplicates of existing events carry no
                    // clinical content beyond the kept twin; still
                    // preserved below if they fall out of the stream.
                    if !is_incoming {
                        rejected.push((envelope.clone(), replay_rejection_code(A::KIND)));
                    }
                } else {
                    let code = replay_rejection_code(A::KIND);
                    if is_incoming {
                        outcomes.push((envelope.event_id(), ReplayOutcome::Rejected { code }));
                    }
                    rejected.push((envelope.clone(), code));
                }
            }
            None => {
                // Unknown event type: keep it in place without folding.
                let version = placed.len() as u64 + 1;
                placed.push(envelope.with_aggregate_version(version));
                if is_incoming {
                    outcomes.push((envelope.event_id(), ReplayOutcome::Accepted { version }));
                }
            }
        }
    }

    install_resolution(store, A::KIND, aggregate_id, &existing, placed)?;
    Ok(StreamResolution { outcomes, rejected })
}

/// Resolution for streams without a state machine: renumber everything in
/// causal order.
fn resolve_unchecked(
    store: &dyn EventStore,
    kind: AggregateKind,
    aggregate_id: Uuid,
    incoming: Vec<EventEnvelope>,
) -> Result<StreamResolution, StoreError> {
    let existing = store.read_stream(kind, aggregate_id);
    let incoming_ids: std::collections::HashSet<Uuid> =
        incoming.iter().map(EventEnvelope::event_id).collect();
    let mut all = existing.clone();
    all.extend(incoming);
    let ordered = causal_order(&all).map_err(|e| StoreError::Storage(e.to_string()))?;
    let placed: Vec<EventEnvelope> = ordered
        .into_iter()
        .enumerate()
        .map(|(i, e)| e.with_aggregate_version(i as u64 + 1))
        .collect();
    let outcomes = placed
        .iter()
        .filter(|e| incoming_ids.contains(&e.event_id()))
        .map(|e| {
            (
                e.event_id(),
                ReplayOutcome::Accepted {
                    version: e.aggregate_version(),
                },
            )
        })
        .collect();
    install_resolution(store, kind, aggregate_id, &existing, placed)?;
    Ok(StreamResolution {
        outcomes,
        rejected: Vec::new(),
    })
}

/// Write the replayed stream back: keep the common prefix, rebuild the
/// rest.
fn install_resolution(
    store: &dyn EventStore,
    kind: AggregateKind,
    aggregate_id: Uuid,
    existing: &[EventEnvelope],
    placed: Vec<EventEnvelope>,
) -> Result<(), StoreError> {
    let keep = existing
        .iter()
        .zip(placed.iter())
        .take_while(|(a, b)| {
            a.event_id() == b.event_id() && a.aggregate_version() == b.aggregate_version()
        })
        .count();
    let suffix: Vec<EventEnvelope> = placed.into_iter().skip(keep).collect();
    if suffix.is_empty() && keep == existing.len() {
        return Ok(());
    }
    store
        .replace_stream_suffix(kind, aggregate_id, keep as u64, suffix)
        .map(|_| ())
}

// ---------------------------------------------------------------------------
// Hub half
// ---------------------------------------------------------------------------

/// The hub side of the protocol: authoritative store, device registry,
/// per-device cursors, and the compensation engine.
pub struct SyncHub {
    store: Arc<dyn EventStore>,
    dispatcher: Arc<EventDispatcher>,
    models: SharedReadModels,
    registry: DeviceRegistry,
    sessions: HashMap<String, SyncState>,
    engine: CompensationEngine,
    hub_session: DeviceSession,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    organization_id: Uuid,
    facility_id: Uuid,
}

impl SyncHub {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EventStore>,
        dispatcher: Arc<EventDispatcher>,
        models: SharedReadModels,
        registry: DeviceRegistry,
        organization_id: Uuid,
        facility_id: Uuid,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            models,
            registry,
            sessions: HashMap::new(),
            engine: CompensationEngine::new(),
            hub_session: DeviceSession::new("hub"),
            clock,
            config,
            organization_id,
            facility_id,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn sync_state(&self, device_id: &str) -> SyncState {
        self.sessions.get(device_id).cloned().unwrap_or_default()
    }

    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    fn download_filter(&self, device_id: &str) -> EventFilter {
        let visibility = self
            .registry
            .get(device_id)
            .and_then(|r| r.visibility.clone());
        EventFilter {
            organization_id: Some(self.organization_id),
            visibility,
            ..EventFilter::default()
        }
    }

    /// Phase 1: validate the device and compute its clock drift.
    pub fn handshake(&mut self, msg: &SyncHandshake) -> SyncHandshakeAck {
        let refused = |status| SyncHandshakeAck {
            status,
            hub_clock: None,
            computed_drift_ms: None,
            hub_current_position: None,
            events_available: None,
        };
        let record = match self.registry.get(&msg.device_id) {
            Some(record) if !record.revoked => record,
            _ => return refused(HandshakeStatus::DeviceRevoked),
        };
        if record.organization_id != msg.organization_id {
            return refused(HandshakeStatus::OrgMismatch);
        }
        if msg.protocol_version != self.config.protocol_version {
            return refused(HandshakeStatus::ProtocolUnsupported);
        }

        let hub_now = self.clock.now();
        let drift_ms = (msg.device_clock - hub_now).num_milliseconds();
        if drift_ms.abs() > self.config.drift_warn_threshold_ms {
            tracing::warn!(
                device_id = %msg.device_id,
                drift_ms,
                "device clock drift exceeds threshold; accepted and annotated"
            );
        }

        let filter = self.download_filter(&msg.device_id);
        let available = self
            .store
            .read_after(&filter, msg.last_downloaded_position, usize::MAX)
            .envelopes
            .len() as u64;

        tracing::info!(device_id = %msg.device_id, drift_ms, available, "sync handshake");
        SyncHandshakeAck {
            status: HandshakeStatus::Ready,
            hub_clock: Some(hub_now),
            computed_drift_ms: Some(drift_ms),
            hub_current_position: Some(self.store.current_position()),
            events_available: Some(available),
        }
    }

    /// Phase 3a: ingest one upload batch.
    pub async fn process_upload(&mut self, device_id: &str, upload: SyncUpload) -> SyncUploadAck {
        let mut ack = SyncUploadAck::default();
        let mut max_lsn = 0u64;
        let mut accepted_envelopes = Vec::new();

        for envelope in &upload.events {
            max_lsn = max_lsn.max(envelope.metadata.local_sequence_number);
            if self.store.exists(envelope.event_id()) {
                ack.duplicate.push(envelope.event_id());
                continue;
            }
            match self.store.append(envelope) {
                Ok(AppendOutcome::Appended(position)) => {
                    ack.accepted.push(envelope.event_id());
                    accepted_envelopes.push((position, envelope.clone()));
                }
                Ok(AppendOutcome::Duplicate) => ack.duplicate.push(envelope.event_id()),
                Err(StoreError::VersionConflict { expected, actual }) => {
                    tracing::info!(
                        device_id,
                        event_id = %envelope.event_id(),
                        expected,
                        actual,
                        "upload version conflict, resolving by causal replay"
                    );
                    match resolve_stream(
                        self.store.as_ref(),
                        envelope.aggregate_type(),
                        envelope.aggregate_id(),
                        vec![envelope.clone()],
                    ) {
                        Ok(resolution) => {
                            self.record_resolution(envelope, resolution, &mut ack).await;
                        }
                        Err(error) => {
                            tracing::error!(device_id, %error, "conflict resolution failed");
                        }
                    }
                }
                Err(StoreError::Storage(message)) => {
                    // Left out of the ack entirely: the device keeps the
                    // entry in its outbox and retries next session.
                    tracing::error!(device_id, %message, "storage failure during upload");
                }
            }
        }

        // Feed the hub read models before the eventual-consistency pass.
        for (position, envelope) in &accepted_envelopes {
            self.dispatcher.offer(envelope, *position).await;
        }
        self.dispatcher.catch_up(self.store.as_ref()).await;
        self.dispatcher.drain().await;

        // Cross-aggregate checks for every event that entered a stream.
        for (_, envelope) in &accepted_envelopes {
            self.run_compensation_checks(envelope, &mut ack).await;
        }

        let state = self.sessions.entry(device_id.to_string()).or_default();
        state.last_uploaded_lsn = state.last_uploaded_lsn.max(max_lsn);
        state.last_sync_at = Some(self.clock.now());
        ack
    }

    /// Record replay outcomes in the ack and emit review items for
    /// whatever the state machine refused.
    async fn record_resolution(
        &mut self,
        uploaded: &EventEnvelope,
        resolution: StreamResolution,
        ack: &mut SyncUploadAck,
    ) {
        let mut any_accepted = false;
        for (event_id, outcome) in resolution.outcomes {
            let wire = match outcome {
                ReplayOutcome::Accepted { version } => {
                    any_accepted = true;
                    ConflictResolution::Accepted {
                        renumbered_to: version,
                    }
                }
                ReplayOutcome::Duplicate => ConflictResolution::Duplicate,
                ReplayOutcome::Rejected { code } => ConflictResolution::CompensationRequired {
                    invariant_code: code,
                },
            };
            ack.conflicted.push(ConflictReport {
                event_id,
                resolution: wire,
            });
        }
        for (rejected_envelope, code) in resolution.rejected {
            self.emit_review(&rejected_envelope, code, ack).await;
        }

        self.dispatcher.catch_up(self.store.as_ref()).await;
        self.dispatcher.drain().await;
        // A renumbered event entered a stream; it gets the same
        // post-commit checks a plainly accepted append gets.
        if any_accepted {
            self.run_compensation_checks(uploaded, ack).await;
        }
    }

    /// Emit a `CompensationRequired` review item preserving `rejected`.
    async fn emit_review(
        &mut self,
        rejected: &EventEnvelope,
        code: InvariantCode,
        ack: &mut SyncUploadAck,
    ) {
        let version = self
            .store
            .stream_version(AggregateKind::CompensationReview, rejected.aggregate_id())
            + 1;
        let hub = HubStamp {
            session: &self.hub_session,
            clock: self.clock.as_ref(),
            organization_id: self.organization_id,
            facility_id: self.facility_id,
        };
        let review = self.engine.review_envelope(
            rejected,
            code,
            serde_json::Value::Null,
            serde_json::Value::Null,
            Some(rejected),
            version,
            &hub,
        );
        match self.store.append(&review) {
            Ok(AppendOutcome::Appended(position)) => {
                self.dispatcher.offer(&review, position).await;
                ack.compensations.push(review);
            }
            Ok(AppendOutcome::Duplicate) => {}
            Err(error) => {
                tracing::error!(%error, "failed to append compensation review item");
            }
        }
    }

    /// Run the eventual-consistency table against one accepted event.
    async fn run_compensation_checks(&mut self, envelope: &EventEnvelope, ack: &mut SyncUploadAck) {
        let violations = self.engine.check_event(envelope, &self.models);
        for violation in violations {
            tracing::info!(
                event_id = %envelope.event_id(),
                code = %violation.code,
                auto = violation.auto_cancel_appointment.is_some(),
                "eventual-consistency violation detected"
            );
            let version = self
                .store
                .stream_version(AggregateKind::CompensationReview, envelope.aggregate_id())
                + 1;
            let hub = HubStamp {
                session: &self.hub_session,
                clock: self.clock.as_ref(),
                organization_id: self.organization_id,
                facility_id: self.facility_id,
            };
            let review = self.engine.review_envelope(
                envelope,
                violation.code,
                violation.stale_snapshot.clone(),
                violation.current_snapshot.clone(),
                None,
                version,
                &hub,
            );
            if let Ok(AppendOutcome::Appended(position)) = self.store.append(&review) {
                self.dispatcher.offer(&review, position).await;
                ack.compensations.push(review);
            }

            if let Some(appointment_id) = violation.auto_cancel_appointment {
                let status = self.models.appointment_status(appointment_id);
                let alive = matches!(
                    status,
                    Some(crate::readmodel::AppointmentStatus::Requested)
                        | Some(crate::readmodel::AppointmentStatus::Confirmed)
                );
                if alive {
                    let version = self
                        .store
                        .stream_version(AggregateKind::Appointment, appointment_id)
                        + 1;
                    let cancel =
                        self.engine
                            .auto_cancel_envelope(envelope, appointment_id, version, &hub);
                    if let Ok(AppendOutcome::Appended(position)) = self.store.append(&cancel) {
                        self.dispatcher.offer(&cancel, position).await;
                        self.dispatcher.drain().await;
                        ack.compensations.push(cancel);
                    }
                }
            }
        }
    }

    /// Phase 3b: one download batch past the device's cursor.
    pub fn build_download(&self, device_id: &str) -> SyncDownload {
        let cursor = self
            .sessions
            .get(device_id)
            .map_or(0, |s| s.last_downloaded_position);
        let filter = self.download_filter(device_id);
        let page = self
            .store
            .read_after(&filter, cursor, self.config.sync_batch_size);
        SyncDownload {
            events: page.envelopes,
            hub_current_position: page.next_cursor,
        }
    }

    /// Device acknowledgement of a download batch; cursors only advance.
    pub fn ack_download(&mut self, device_id: &str, ack: &SyncDownloadAck) {
        let state = self.sessions.entry(device_id.to_string()).or_default();
        state.last_downloaded_position = state.last_downloaded_position.max(ack.last_hub_position);
        state.last_sync_at = Some(self.clock.now());
    }
}

// ---------------------------------------------------------------------------
// Device half
// ---------------------------------------------------------------------------

/// Device-side sync endpoint over the local store, outbox, and cursors.
pub struct DeviceSync {
    store: Arc<dyn EventStore>,
    dispatcher: Arc<EventDispatcher>,
    session: Arc<DeviceSession>,
    outbox: Arc<Outbox>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    organization_id: Uuid,
    /// Mirror of the hub's `last_downloaded_position` for this device.
    downloaded_position: AtomicU64,
}

impl DeviceSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EventStore>,
        dispatcher: Arc<EventDispatcher>,
        session: Arc<DeviceSession>,
        outbox: Arc<Outbox>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
        organization_id: Uuid,
    ) -> Self {
        Self {
            store,
            dispatcher,
            session,
            outbox,
            clock,
            config,
            organization_id,
            downloaded_position: AtomicU64::new(0),
        }
    }

    pub fn device_id(&self) -> &str {
        self.session.device_id()
    }

    /// Phase 1 request.
    pub fn handshake_request(&self) -> SyncHandshake {
        SyncHandshake {
            device_id: self.session.device_id().to_string(),
            organization_id: self.organization_id,
            protocol_version: self.config.protocol_version,
            last_downloaded_position: self.downloaded_position.load(Ordering::SeqCst),
            device_lsn: self.session.current_lsn(),
            pending_count: self.outbox.len() as u32,
            device_clock: self.clock.now(),
        }
    }

    /// Persist the hub's verdict; refusals abort the session.
    pub fn apply_handshake_ack(&self, ack: &SyncHandshakeAck) -> Result<(), SyncError> {
        if ack.status != HandshakeStatus::Ready {
            return Err(SyncError::Refused(ack.status));
        }
        if let Some(drift) = ack.computed_drift_ms {
            self.session.set_drift_ms(drift);
        }
        Ok(())
    }

    /// Phase 3a: next outbox batch in LSN order, or `None` when drained.
    pub fn next_upload(&self) -> Option<SyncUpload> {
        let entries = self.outbox.pending(self.config.sync_batch_size);
        if entries.is_empty() {
            return None;
        }
        let batch_id = Uuid::new_v4();
        let events: Vec<EventEnvelope> = entries
            .iter()
            .filter_map(|entry| self.store.read_event(entry.event_id))
            .map(|envelope| envelope.with_sync_batch_id(batch_id))
            .collect();
        Some(SyncUpload {
            sync_batch_id: batch_id,
            events,
        })
    }

    /// Prune every event the hub gave a terminal disposition, and apply
    /// any compensations the hub returned inline (idempotent; they will
    /// also arrive through download).
    pub async fn apply_upload_ack(&self, ack: &SyncUploadAck) {
        let mut settled: Vec<Uuid> = Vec::new();
        settled.extend(&ack.accepted);
        settled.extend(&ack.duplicate);
        settled.extend(ack.conflicted.iter().map(|c| c.event_id));
        self.outbox.prune(&settled);

        for envelope in &ack.compensations {
            self.ingest(envelope).await;
        }
    }

    /// Phase 3b: apply one download batch, deduplicating by event id.
    pub async fn apply_download(&self, download: &SyncDownload) -> SyncDownloadAck {
        for envelope in &download.events {
            self.ingest(envelope).await;
        }
        self.downloaded_position
            .fetch_max(download.hub_current_position, Ordering::SeqCst);
        self.dispatcher.drain().await;
        SyncDownloadAck {
            received_count: download.events.len() as u64,
            last_hub_position: download.hub_current_position,
        }
    }

    /// Append one remote envelope locally, resolving conflicts with the
    /// same deterministic replay the hub uses (without emitting review
    /// items; those are hub events and arrive by download).
    async fn ingest(&self, envelope: &EventEnvelope) {
        match self.store.append(envelope) {
            Ok(AppendOutcome::Appended(position)) => {
                self.dispatcher.offer(envelope, position).await;
            }
            Ok(AppendOutcome::Duplicate) => {
                // The hub may have renumbered an event this device already
                // holds; re-replay the stream so both sides converge on
                // the same numbering.
                if let Some(local) = self.store.read_event(envelope.event_id())
                    && local.aggregate_version() != envelope.aggregate_version()
                    && let Err(error) = resolve_stream(
                        self.store.as_ref(),
                        envelope.aggregate_type(),
                        envelope.aggregate_id(),
                        vec![envelope.clone()],
                    )
                {
                    tracing::error!(%error, "device-side renumber repair failed");
                }
            }
            Err(StoreError::VersionConflict { .. }) => {
                if let Err(error) = resolve_stream(
                    self.store.as_ref(),
                    envelope.aggregate_type(),
                    envelope.aggregate_id(),
                    vec![envelope.clone()],
                ) {
                    tracing::error!(%error, "device-side conflict resolution failed");
                }
                self.dispatcher.catch_up(self.store.as_ref()).await;
            }
            Err(StoreError::Storage(message)) => {
                tracing::error!(%message, "device-side storage failure during download");
            }
        }
    }
}

/// Sync session failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("handshake refused: {0:?}")]
    Refused(HandshakeStatus),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Summary of one full sync session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub uploaded: usize,
    pub duplicates: usize,
    pub conflicted: usize,
    pub compensations: usize,
    pub downloaded: usize,
}

/// Drive the four phases of one device/hub session to completion.
pub async fn run_sync(device: &DeviceSync, hub: &mut SyncHub) -> Result<SyncReport, SyncError> {
    let mut report = SyncReport::default();

    // Phase 1: handshake.
    let handshake = device.handshake_request();
    let ack = hub.handshake(&handshake);
    device.apply_handshake_ack(&ack)?;

    // Phase 2 needs no message exchange: the hub's cursor and the
    // device's outbox already determine both transfer sets.

    // Phase 3a: upload until the outbox drains or stops shrinking.
    loop {
        let before = device.outbox.len();
        let Some(upload) = device.next_upload() else {
            break;
        };
        let ack = hub.process_upload(device.device_id(), upload).await;
        report.uploaded += ack.accepted.len();
        report.duplicates += ack.duplicate.len();
        report.conflicted += ack.conflicted.len();
        report.compensations += ack.compensations.len();
        device.apply_upload_ack(&ack).await;
        if device.outbox.len() >= before {
            // Storage trouble left entries unsettled; retry next session.
            break;
        }
    }

    // Phase 3b: download until a batch comes back empty.
    loop {
        let download = hub.build_download(device.device_id());
        let empty = download.events.is_empty();
        let ack = device.apply_download(&download).await;
        report.downloaded += ack.received_count as usize;
        hub.ack_download(device.device_id(), &ack);
        if empty {
            break;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::envelope::test_fixtures::envelope;
    use crate::readmodel::SharedReadModels;
    use crate::store::InMemoryEventStore;
    use chrono::DateTime;

    fn hub_with_device(device_id: &str, organization_id: Uuid) -> SyncHub {
        let clock = Arc::new(FixedClock::at(
            DateTime::parse_from_rfc3339("2026-03-01T09:00:00+00:00").expect("valid rfc3339"),
        ));
        let mut registry = DeviceRegistry::new();
        registry.register(DeviceRecord {
            device_id: device_id.to_string(),
            organization_id,
            revoked: false,
            visibility: None,
        });
        let models = SharedReadModels::new();
        let mut dispatcher = EventDispatcher::new(CoreConfig::default(), clock.clone());
        dispatcher.register(Box::new(models.clone()));
        SyncHub::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(dispatcher),
            models,
            registry,
            organization_id,
            Uuid::new_v4(),
            clock,
            CoreConfig::default(),
        )
    }

    fn handshake_from(device_id: &str, organization_id: Uuid, protocol_version: u32) -> SyncHandshake {
        SyncHandshake {
            device_id: device_id.to_string(),
            organization_id,
            protocol_version,
            last_downloaded_position: 0,
            device_lsn: 0,
            pending_count: 0,
            device_clock: DateTime::parse_from_rfc3339("2026-03-01T09:00:02+00:00")
                .expect("valid rfc3339"),
        }
    }

    #[test]
    fn handshake_computes_drift_for_known_device() {
        let org = Uuid::new_v4();
        let mut hub = hub_with_device("d1", org);
        let ack = hub.handshake(&handshake_from("d1", org, 1));
        assert_eq!(ack.status, HandshakeStatus::Ready);
        // The device clock reads two seconds ahead of the hub.
        assert_eq!(ack.computed_drift_ms, Some(2000));
        assert_eq!(ack.hub_current_position, Some(0));
        assert_eq!(ack.events_available, Some(0));
    }

    #[test]
    fn handshake_refuses_unknown_and_revoked_devices() {
        let org = Uuid::new_v4();
        let mut hub = hub_with_device("d1", org);
        let ack = hub.handshake(&handshake_from("ghost", org, 1));
        assert_eq!(ack.status, HandshakeStatus::DeviceRevoked);
        assert_eq!(ack.computed_drift_ms, None);

        hub.registry_mut().revoke("d1");
        let ack = hub.handshake(&handshake_from("d1", org, 1));
        assert_eq!(ack.status, HandshakeStatus::DeviceRevoked);
    }

    #[test]
    fn handshake_refuses_org_mismatch_and_bad_protocol() {
        let org = Uuid::new_v4();
        let mut hub = hub_with_device("d1", org);
        let ack = hub.handshake(&handshake_from("d1", Uuid::new_v4(), 1));
        assert_eq!(ack.status, HandshakeStatus::OrgMismatch);

        let ack = hub.handshake(&handshake_from("d1", org, 2));
        assert_eq!(ack.status, HandshakeStatus::ProtocolUnsupported);
    }

    #[tokio::test]
    async fn upload_marks_known_events_duplicate() {
        let org = Uuid::new_v4();
        let mut hub = hub_with_device("d1", org);
        let mut env = envelope(
            AggregateKind::Symptom,
            Uuid::new_v4(),
            1,
            "clinical.observation.SymptomReported",
        );
        env.metadata.organization_id = org;

        let upload = SyncUpload {
            sync_batch_id: Uuid::new_v4(),
            events: vec![env.clone()],
        };
        let first = hub.process_upload("d1", upload.clone()).await;
        assert_eq!(first.accepted, vec![env.event_id()]);
        assert!(first.duplicate.is_empty());

        let second = hub.process_upload("d1", upload).await;
        assert!(second.accepted.is_empty());
        assert_eq!(second.duplicate, vec![env.event_id()]);
        assert_eq!(hub.sync_state("d1").last_uploaded_lsn, 1);
    }

    #[test]
    fn wire_messages_round_trip_as_json() {
        let ack = SyncUploadAck {
            accepted: vec![Uuid::new_v4()],
            duplicate: vec![],
            conflicted: vec![ConflictReport {
                event_id: Uuid::new_v4(),
                resolution: ConflictResolution::Accepted { renumbered_to: 3 },
            }],
            compensations: vec![],
        };
        let json = serde_json::to_string(&ack).expect("serialize");
        let back: SyncUploadAck = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, ack);

        let status = serde_json::to_value(HandshakeStatus::ProtocolUnsupported).expect("serialize");
        assert_eq!(status, "protocol_unsupported");
    }
}
