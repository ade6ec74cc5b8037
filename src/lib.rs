//! Offline-first event-sourced core for ambulatory clinical records.
//!
//! `chartsync` is the write-side domain kernel plus the sync and
//! causal-ordering protocol of a hub-and-spoke clinical system: tablets
//! and laptops record clinical facts while disconnected, and a central
//! hub reconciles them without ever discarding a persisted event.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`EventEnvelope`] | Immutable event record with mandatory metadata |
//! | [`EventStore`] | Append-only per-aggregate streams, optimistic concurrency |
//! | [`Aggregate`] | Pure `decide` / `apply` / `admits` over a state machine |
//! | [`ClinicalCore`] | Composition root: gateway → handler → store → dispatcher |
//! | [`EventDispatcher`] | At-least-once delivery to projections, with dead letters |
//! | [`causal_order`] | Deterministic six-rule total order over any event set |
//! | [`SyncHub`] / [`DeviceSync`] | The four-phase hub/spoke sync protocol |
//! | [`CompensationEngine`] | Eventual-consistency review items and auto-compensation |
//!
//! # Consistency model
//!
//! Within one aggregate stream, invariants are strong: the store only
//! accepts version `n+1`, and a concurrent writer forces a retry from
//! fresh state. Across aggregates, consistency is eventual: command
//! handlers consult local read models (possibly stale offline), and the
//! hub re-checks every uploaded event, preserving violations as
//! `CompensationRequired` review events instead of rejecting data.
//!
//! # Quick Start
//!
//! ```no_run
//! use chartsync::{ClinicalCore, CommandRequest};
//! use uuid::Uuid;
//!
//! # async fn run() {
//! let core = ClinicalCore::builder("tablet-1", Uuid::new_v4()).build();
//! let outcome = core
//!     .submit(CommandRequest {
//!         command_type: "RegisterPatient".to_string(),
//!         payload: serde_json::json!({
//!             "patient_id": Uuid::new_v4().to_string(),
//!             "given_name": "Ada",
//!             "family_name": "Osei",
//!             "date_of_birth": "1980-05-17",
//!             "occurred_at": "2026-03-01T08:55:00+00:00",
//!             "performed_by": Uuid::new_v4().to_string(),
//!             "performer_role": "front_desk",
//!             "organization_id": Uuid::new_v4().to_string(),
//!             "facility_id": Uuid::new_v4().to_string(),
//!             "device_id": "tablet-1",
//!             "connection_status": "online",
//!         }),
//!     })
//!     .await;
//! assert!(outcome.is_success());
//! # }
//! ```

pub mod aggregate;
pub mod causal;
pub mod clock;
pub mod command;
pub mod compensation;
pub mod config;
mod core;
pub mod device;
pub mod dispatcher;
pub mod domain;
pub mod envelope;
pub mod gateway;
pub mod handler;
pub mod invariant;
pub mod projection;
pub mod query;
pub mod readmodel;
pub mod store;
pub mod sync;

pub use aggregate::{Aggregate, DomainError, decode_domain_event, encode_domain_event, rehydrate};
pub use causal::{CausalIntegrityViolation, causal_order};
pub use clock::{Clock, FixedClock, SystemClock};
pub use command::{ClinicalCommand, CommandContext};
pub use compensation::{CompensationEngine, CompensationPayload, COMPENSATION_EVENT_TYPE};
pub use config::CoreConfig;
pub use crate::core::{ClinicalCore, CoreBuilder};
pub use device::{DeviceSession, Outbox};
pub use dispatcher::{DeadLetter, EventDispatcher};
pub use envelope::{
    AggregateKind, Audience, ConnectionStatus, EventEnvelope, EventMetadata, PerformerRole,
};
pub use gateway::{CommandOutcome, CommandRequest};
pub use handler::{CommandError, TransientSource};
pub use invariant::InvariantCode;
pub use projection::{Projection, ProjectionError, ProjectionMode};
pub use query::{QueryGateway, QueryRequest, QueryResult};
pub use readmodel::{
    AppointmentStatus, DiagnosisStatus, EncounterState, PatientStatus, SharedReadModels,
};
pub use store::{
    AppendOutcome, EventFilter, EventStore, InMemoryEventStore, ReadPage, StoreError,
};
pub use sync::{
    ConflictReport, ConflictResolution, DeviceRecord, DeviceRegistry, DeviceSync, HandshakeStatus,
    SyncDownload, SyncDownloadAck, SyncError, SyncHandshake, SyncHandshakeAck, SyncHub, SyncReport,
    SyncState, SyncUpload, SyncUploadAck, run_sync,
};
