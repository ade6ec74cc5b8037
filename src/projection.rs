//! Projection trait: read models folded from the event log.
//!
//! Projections are eventually consistent and disposable. Each one declares
//! a filter over the log and a delivery mode; the dispatcher owns the
//! delivery plumbing (inboxes, checkpoints, retries, dead letters).
//!
//! # Contract
//!
//! - [`apply`](Projection::apply) must be deterministic: the same event
//!   sequence produces the same state.
//! - Events arrive in store insertion order. Per-stream relative order is
//!   guaranteed; cross-stream wall-clock order is not. Projections that
//!   need a semantic cross-stream order sort their own view with the
//!   causal orderer.
//! - Unknown event types should be ignored for forward compatibility.

use crate::envelope::EventEnvelope;
use crate::store::EventFilter;

/// Delivery mode of a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionMode {
    /// Fed by the in-process bus at post-commit, plus catch-up polling.
    Live,
    /// Updated only when explicitly caught up before a read.
    OnDemand,
    /// Updated by a periodic catch-up sweep.
    Periodic,
}

/// A projection handler failed to apply an event.
///
/// The dispatcher retries with backoff and dead-letters on exhaustion;
/// failures never reach the write side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("projection apply failed: {0}")]
pub struct ProjectionError(pub String);

/// A read model fed by the event dispatcher.
pub trait Projection: Send + Sync {
    /// Registry name, unique per dispatcher.
    fn name(&self) -> &'static str;

    /// Which events this projection wants.
    fn filter(&self) -> EventFilter {
        EventFilter::any()
    }

    fn mode(&self) -> ProjectionMode {
        ProjectionMode::Live
    }

    /// Fold one envelope into the projection state.
    fn apply(&mut self, envelope: &EventEnvelope) -> Result<(), ProjectionError>;
}
