//! Aggregate trait, rehydration, and the envelope/domain-event codec.
//!
//! An aggregate is the smallest transactional boundary. Each kind exposes a
//! pure decision function and a pure, total fold; state is ephemeral and is
//! always derived by replaying the stream. Domain events are adjacently
//! tagged enums (`#[serde(tag = "type", content = "data")]`); the tag joined
//! with the aggregate's namespace becomes the envelope's `event_type` and
//! the `data` portion becomes the payload.

use chrono::{DateTime, Duration, FixedOffset};
use serde::{Serialize, de::DeserializeOwned};

use crate::clock::Clock;
use crate::envelope::{AggregateKind, EventEnvelope};
use crate::invariant::InvariantCode;

/// How far in the future `occurred_at` may lie before the command is
/// rejected with `INV-XX-1`. Tolerates ordinary clock skew between the
/// point-of-care device and whoever entered the clinical time.
pub const MAX_FUTURE_SKEW: Duration = Duration::minutes(5);

/// An aggregate rejected a command.
///
/// Carries the stable invariant code for localization plus free-text
/// detail for logs. Callers must not retry mechanically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct DomainError {
    /// The violated invariant.
    pub code: InvariantCode,
    /// Human-readable detail, not part of the wire contract.
    pub detail: String,
}

impl DomainError {
    pub fn new(code: InvariantCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// A clinical aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
///
/// # Contract
///
/// - [`decide`](Aggregate::decide) is a pure decision function: no I/O, no
///   side effects. It reads only the current state and the command; the
///   clock capability is used solely to reject far-future `occurred_at`.
///   Fact aggregates return exactly one creation event or an error.
/// - [`apply`](Aggregate::apply) is pure and total: every valid event for
///   this aggregate folds into the next state.
/// - [`admits`](Aggregate::admits) answers whether an event is a legal
///   transition from the current state. Conflict resolution replays
///   contested streams through it without a command in hand.
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// Which stream family this aggregate's events live in.
    const KIND: AggregateKind;

    /// Namespace prefix of every event type, e.g. `"clinical.encounter"`.
    const EVENT_NAMESPACE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    fn decide(
        &self,
        cmd: Self::Command,
        clock: &dyn Clock,
    ) -> Result<Vec<Self::DomainEvent>, DomainError>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;

    /// Whether `event` is a permitted transition from the current state.
    fn admits(&self, event: &Self::DomainEvent) -> bool;

    /// Clinical time carried by the command, stamped as `occurred_at`.
    fn occurred_at(cmd: &Self::Command) -> DateTime<FixedOffset>;
}

/// Reject commands whose clinical time lies too far in the future.
///
/// Called at the top of every `decide`; the tolerance is [`MAX_FUTURE_SKEW`].
pub fn guard_occurred_at(
    occurred_at: DateTime<FixedOffset>,
    clock: &dyn Clock,
) -> Result<(), DomainError> {
    if occurred_at > clock.now() + MAX_FUTURE_SKEW {
        return Err(DomainError::new(
            InvariantCode::XX1,
            format!("occurred_at {occurred_at} lies more than 5 minutes in the future"),
        ));
    }
    Ok(())
}

/// Serialize a domain event into its namespaced type and payload.
///
/// The adjacently tagged form `{"type": "EncounterBegan", "data": {...}}`
/// splits into `("clinical.encounter.EncounterBegan", {...})`; unit
/// variants produce an empty object payload so payload field lookups stay
/// uniform.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
) -> serde_json::Result<(String, serde_json::Value)> {
    let value = serde_json::to_value(event)?;
    let obj = value
        .as_object()
        .expect("adjacently tagged enum must serialize to a JSON object");
    let tag = obj["type"]
        .as_str()
        .expect("adjacently tagged enum must have a string 'type' field");
    let payload = obj
        .get("data")
        .cloned()
        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
    Ok((format!("{}.{tag}", A::EVENT_NAMESPACE), payload))
}

/// Reconstruct a domain event from an envelope.
///
/// Returns `None` when the envelope belongs to another namespace or its
/// type tag is unknown to this aggregate version; callers skip such events
/// for forward compatibility.
pub fn decode_domain_event<A: Aggregate>(envelope: &EventEnvelope) -> Option<A::DomainEvent> {
    let tag = envelope
        .event_type()
        .strip_prefix(A::EVENT_NAMESPACE)?
        .strip_prefix('.')?;
    let tagged = serde_json::json!({
        "type": tag,
        "data": envelope.payload,
    });
    serde_json::from_value::<A::DomainEvent>(tagged).ok()
}

/// Rebuild aggregate state by folding the stream through `apply`.
///
/// Unknown or foreign event types leave the state unchanged.
pub fn rehydrate<A: Aggregate>(stream: &[EventEnvelope]) -> A {
    stream.iter().fold(A::default(), |state, envelope| {
        match decode_domain_event::<A>(envelope) {
            Some(event) => state.apply(&event),
            None => state,
        }
    })
}

/// Replay a stream and answer whether `envelope` would be admitted next.
///
/// Used by sync conflict resolution, where contested events arrive as
/// envelopes rather than commands.
pub fn envelope_admitted<A: Aggregate>(state: &A, envelope: &EventEnvelope) -> bool {
    match decode_domain_event::<A>(envelope) {
        Some(event) => state.admits(&event),
        None => false,
    }
}
