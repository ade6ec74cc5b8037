//! Append-only event store: per-aggregate streams, optimistic concurrency,
//! idempotent append, and filtered paging.
//!
//! The store is the single owned mutable resource of the write side. It
//! enforces exactly one rule of its own: within a stream, versions continue
//! `1, 2, 3, ...` with no gaps (`INV-XX-3`); everything else is the
//! aggregates' business. Appending an event whose id is already known is a
//! silent no-op, which is what makes sync retries and redeliveries safe.
//!
//! [`read_after`](EventStore::read_after) pages in insertion order. That is
//! not a semantic order; consumers that need one apply the causal orderer.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{AggregateKind, Audience, EventEnvelope};

/// Result of a successful append call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The envelope was written at this global position.
    Appended(u64),
    /// An envelope with this `event_id` already exists; nothing was written.
    Duplicate,
}

/// Append failures. `AlreadyExists` is not an error: it surfaces as
/// [`AppendOutcome::Duplicate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The envelope's version does not continue the stream (`INV-XX-3`).
    #[error("version conflict: expected {expected}, got {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    /// Underlying storage failure; callers treat this as transient.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Filter for [`EventStore::read_after`].
///
/// Empty fields match everything. `patient_id` matches events whose payload
/// carries that `patient_id`, plus the patient's own registration stream.
/// `visibility` is a mask: an event passes when the masks intersect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<BTreeSet<String>>,
    pub aggregate_types: Option<BTreeSet<AggregateKind>>,
    pub organization_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub visibility: Option<BTreeSet<Audience>>,
}

impl EventFilter {
    /// A filter that matches every event.
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to one organization.
    pub fn for_organization(organization_id: Uuid) -> Self {
        Self {
            organization_id: Some(organization_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        if let Some(ref types) = self.event_types
            && !types.contains(envelope.event_type())
        {
            return false;
        }
        if let Some(ref kinds) = self.aggregate_types
            && !kinds.contains(&envelope.aggregate_type())
        {
            return false;
        }
        if let Some(org) = self.organization_id
            && envelope.metadata.organization_id != org
        {
            return false;
        }
        if let Some(patient) = self.patient_id {
            let in_payload = envelope.payload_uuid("patient_id") == Some(patient);
            let is_registration = envelope.aggregate_type() == AggregateKind::PatientRegistration
                && envelope.aggregate_id() == patient;
            if !in_payload && !is_registration {
                return false;
            }
        }
        if let Some(ref mask) = self.visibility
            && envelope.metadata.visibility.intersection(mask).next().is_none()
        {
            return false;
        }
        true
    }
}

/// One page of a filtered read.
#[derive(Debug, Clone)]
pub struct ReadPage {
    pub envelopes: Vec<EventEnvelope>,
    /// Pass this back as the cursor of the next call. Equal to the position
    /// of the last envelope scanned, whether or not it matched.
    pub next_cursor: u64,
}

/// The storage boundary of the core.
///
/// Durable backends implement this trait; the in-memory implementation
/// below is sufficient for the core's own tests and for device simulation.
/// Append is the only mutating operation in normal running.
/// [`replace_stream_suffix`](EventStore::replace_stream_suffix) exists
/// solely for sync conflict resolution, which must renumber a contested
/// suffix; every event it displaces is returned to the caller, which is
/// obligated to preserve it in a compensation review item.
pub trait EventStore: Send + Sync {
    /// Append one envelope.
    ///
    /// Rejects the append with [`StoreError::VersionConflict`] unless
    /// `aggregate_version == stream length + 1`. An envelope whose
    /// `event_id` already exists anywhere in the store is a no-op reported
    /// as [`AppendOutcome::Duplicate`]. Durable at return.
    fn append(&self, envelope: &EventEnvelope) -> Result<AppendOutcome, StoreError>;

    /// All live events of one stream, ascending by `aggregate_version`.
    fn read_stream(&self, kind: AggregateKind, aggregate_id: Uuid) -> Vec<EventEnvelope>;

    /// Filtered events with position greater than `cursor`, in insertion
    /// order, at most `limit` of them.
    fn read_after(&self, filter: &EventFilter, cursor: u64, limit: usize) -> ReadPage;

    /// Whether any envelope with this id was ever accepted, including
    /// events later displaced by conflict resolution.
    fn exists(&self, event_id: Uuid) -> bool;

    /// Fetch one envelope by id. Used by the sync upload path to turn
    /// outbox entries back into envelopes.
    fn read_event(&self, event_id: Uuid) -> Option<EventEnvelope>;

    /// Current length of a stream (0 when absent).
    fn stream_version(&self, kind: AggregateKind, aggregate_id: Uuid) -> u64;

    /// Position of the most recent append (0 when empty).
    fn current_position(&self) -> u64;

    /// Every live event in insertion order. Test and rebuild helper.
    fn read_all(&self) -> Vec<EventEnvelope>;

    /// Rebuild a stream's tail during sync conflict resolution.
    ///
    /// Keeps the first `keep_len` events, installs `suffix` (whose versions
    /// must continue `keep_len+1, keep_len+2, ...`), and returns the
    /// displaced events that were not re-installed. Displaced events stay
    /// in the log for position stability but are invisible to
    /// `read_stream`/`read_after`; their ids remain known to [`exists`].
    fn replace_stream_suffix(
        &self,
        kind: AggregateKind,
        aggregate_id: Uuid,
        keep_len: u64,
        suffix: Vec<EventEnvelope>,
    ) -> Result<Vec<EventEnvelope>, StoreError>;
}

#[derive(Default)]
struct StoreInner {
    /// Global log in insertion order. Position = index + 1, stable forever.
    log: Vec<EventEnvelope>,
    /// Live stream membership: log indices ascending by version.
    streams: HashMap<(AggregateKind, Uuid), Vec<usize>>,
    /// Every event id ever accepted, mapped to its latest log index.
    ids: HashMap<Uuid, usize>,
    /// Log indices displaced by conflict resolution.
    displaced: HashSet<usize>,
}

/// In-memory [`EventStore`] used by tests and device simulations.
///
/// Interior mutability behind a `std::sync::RwLock`; the lock is held only
/// for the duration of each call.
#[derive(Default)]
pub struct InMemoryEventStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err<T>(e: std::sync::PoisonError<T>) -> StoreError {
        StoreError::Storage(e.to_string())
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, envelope: &EventEnvelope) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.inner.write().map_err(Self::lock_err)?;

        if inner.ids.contains_key(&envelope.event_id()) {
            return Ok(AppendOutcome::Duplicate);
        }

        let key = (envelope.aggregate_type(), envelope.aggregate_id());
        let expected = inner.streams.get(&key).map_or(0, Vec::len) as u64 + 1;
        if envelope.aggregate_version() != expected {
            return Err(StoreError::VersionConflict {
                expected,
                actual: envelope.aggregate_version(),
            });
        }

        let index = inner.log.len();
        inner.log.push(envelope.clone());
        inner.streams.entry(key).or_default().push(index);
        inner.ids.insert(envelope.event_id(), index);
        Ok(AppendOutcome::Appended(index as u64 + 1))
    }

    fn read_stream(&self, kind: AggregateKind, aggregate_id: Uuid) -> Vec<EventEnvelope> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .streams
            .get(&(kind, aggregate_id))
            .map(|indices| indices.iter().map(|&i| inner.log[i].clone()).collect())
            .unwrap_or_default()
    }

    fn read_after(&self, filter: &EventFilter, cursor: u64, limit: usize) -> ReadPage {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut envelopes = Vec::new();
        let mut next_cursor = cursor;
        for index in (cursor as usize)..inner.log.len() {
            next_cursor = index as u64 + 1;
            if inner.displaced.contains(&index) {
                continue;
            }
            let envelope = &inner.log[index];
            if filter.matches(envelope) {
                envelopes.push(envelope.clone());
                if envelopes.len() == limit {
                    break;
                }
            }
        }
        ReadPage {
            envelopes,
            next_cursor,
        }
    }

    fn exists(&self, event_id: Uuid) -> bool {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.ids.contains_key(&event_id)
    }

    fn read_event(&self, event_id: Uuid) -> Option<EventEnvelope> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.ids.get(&event_id).map(|&index| inner.log[index].clone())
    }

    fn stream_version(&self, kind: AggregateKind, aggregate_id: Uuid) -> u64 {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.streams.get(&(kind, aggregate_id)).map_or(0, Vec::len) as u64
    }

    fn current_position(&self) -> u64 {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.log.len() as u64
    }

    fn read_all(&self) -> Vec<EventEnvelope> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .log
            .iter()
            .enumerate()
            .filter(|(i, _)| !inner.displaced.contains(i))
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn replace_stream_suffix(
        &self,
        kind: AggregateKind,
        aggregate_id: Uuid,
        keep_len: u64,
        suffix: Vec<EventEnvelope>,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let mut inner = self.inner.write().map_err(Self::lock_err)?;
        let key = (kind, aggregate_id);
        let current_len = inner.streams.get(&key).map_or(0, Vec::len) as u64;
        if keep_len > current_len {
            return Err(StoreError::Storage(format!(
                "cannot keep {keep_len} events of a {current_len}-event stream"
            )));
        }
        for (offset, envelope) in suffix.iter().enumerate() {
            let expected = keep_len + offset as u64 + 1;
            if envelope.aggregate_version() != expected {
                return Err(StoreError::VersionConflict {
                    expected,
                    actual: envelope.aggregate_version(),
                });
            }
        }

        // Detach the tail. Events re-installed by the suffix keep their id
        // registration (pointed at the new log entry); the rest are
        // displaced and returned for compensation review.
        let suffix_ids: HashSet<Uuid> = suffix.iter().map(EventEnvelope::event_id).collect();
        let tail: Vec<usize> = inner
            .streams
            .get_mut(&key)
            .map(|indices| indices.split_off(keep_len as usize))
            .unwrap_or_default();
        let mut removed = Vec::new();
        for index in tail {
            inner.displaced.insert(index);
            let envelope = inner.log[index].clone();
            if !suffix_ids.contains(&envelope.event_id()) {
                removed.push(envelope);
            }
        }

        for envelope in suffix {
            let index = inner.log.len();
            inner.log.push(envelope.clone());
            inner.streams.entry(key).or_default().push(index);
            inner.ids.insert(envelope.event_id(), index);
        }
        Ok(removed)
    }
}
