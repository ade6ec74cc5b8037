//! Asynchronous at-least-once delivery of persisted events to projections.
//!
//! Each registered projection owns a FIFO inbox, a processed-id set, a
//! checkpoint, and a dead-letter queue. Inboxes are fed two ways: the
//! in-process bus offers every event at post-commit, and a catch-up poller
//! pulls anything past the fetch watermark from the store. Delivery is
//! idempotent by event id, so the two feeds can overlap freely.
//!
//! A failing handler is retried with exponential backoff; when retries are
//! exhausted the event moves to that projection's dead-letter queue and
//! delivery continues with the next event. Dispatcher failures never reach
//! the write side.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{CoreConfig, backoff_delay};
use crate::envelope::EventEnvelope;
use crate::projection::{Projection, ProjectionMode};
use crate::store::EventStore;

/// An event a projection repeatedly failed to apply.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event_id: Uuid,
    pub reason: String,
    pub attempts: u32,
    pub first_seen: DateTime<FixedOffset>,
    pub last_seen: DateTime<FixedOffset>,
}

struct Slot {
    projection: Box<dyn Projection>,
    inbox: VecDeque<(u64, EventEnvelope)>,
    processed: HashSet<Uuid>,
    /// Highest position pulled into the inbox (live or catch-up).
    fetched: u64,
    /// Highest position durably applied.
    checkpoint: u64,
    dead_letters: Vec<DeadLetter>,
}

impl Slot {
    fn wants(&self, envelope: &EventEnvelope) -> bool {
        self.projection.filter().matches(envelope)
            && !self.processed.contains(&envelope.event_id())
    }
}

/// Registry and delivery loop for projections.
pub struct EventDispatcher {
    slots: Mutex<Vec<Slot>>,
    config: CoreConfig,
    clock: Arc<dyn Clock>,
}

impl EventDispatcher {
    pub fn new(config: CoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            config,
            clock,
        }
    }

    /// Register a projection. Intended for wiring time, before the
    /// dispatcher is shared.
    pub fn register(&mut self, projection: Box<dyn Projection>) {
        tracing::debug!(projection = projection.name(), "registering projection");
        self.slots.get_mut().push(Slot {
            projection,
            inbox: VecDeque::new(),
            processed: HashSet::new(),
            fetched: 0,
            checkpoint: 0,
            dead_letters: Vec::new(),
        });
    }

    /// Post-commit notification: enqueue `envelope` for every live
    /// projection whose filter matches. Never fails; durability is the
    /// store's business and catch-up covers missed offers.
    pub async fn offer(&self, envelope: &EventEnvelope, position: u64) {
        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut() {
            if slot.projection.mode() == ProjectionMode::Live
                && position > slot.fetched
                && slot.wants(envelope)
            {
                slot.inbox.push_back((position, envelope.clone()));
                slot.fetched = position;
            }
        }
    }

    /// Pull events past each projection's fetch watermark from the store.
    /// Used by the catch-up poller and by on-demand reads.
    pub async fn catch_up(&self, store: &dyn EventStore) {
        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut() {
            loop {
                let page = store.read_after(
                    &slot.projection.filter(),
                    slot.fetched,
                    self.config.sync_batch_size,
                );
                let scanned_to = page.next_cursor;
                let empty = page.envelopes.is_empty();
                for envelope in page.envelopes {
                    if !slot.processed.contains(&envelope.event_id()) {
                        slot.inbox.push_back((scanned_to, envelope));
                    }
                }
                if slot.fetched == scanned_to {
                    break;
                }
                slot.fetched = scanned_to;
                if empty {
                    break;
                }
            }
        }
    }

    /// Process every inbox to quiescence. Returns the number of events
    /// applied across all projections.
    pub async fn drain(&self) -> usize {
        let mut applied = 0;
        loop {
            // Take one item per pass so a long inbox in one projection
            // does not starve the others, and so the lock is never held
            // across a backoff sleep.
            let work = {
                let mut slots = self.slots.lock().await;
                let mut batch = Vec::new();
                for (index, slot) in slots.iter_mut().enumerate() {
                    if let Some(item) = slot.inbox.pop_front() {
                        batch.push((index, item));
                    }
                }
                batch
            };
            if work.is_empty() {
                return applied;
            }
            for (index, (position, envelope)) in work {
                if self.deliver(index, position, &envelope).await {
                    applied += 1;
                }
            }
        }
    }

    /// Deliver one envelope to one projection with bounded retries.
    /// Returns whether the event was applied (false for duplicates and
    /// dead-lettered events).
    async fn deliver(&self, index: usize, position: u64, envelope: &EventEnvelope) -> bool {
        let first_seen = self.clock.now();
        let mut attempt = 0u32;
        loop {
            let result = {
                let mut slots = self.slots.lock().await;
                let slot = &mut slots[index];
                if slot.processed.contains(&envelope.event_id()) {
                    return false;
                }
                slot.projection.apply(envelope)
            };
            match result {
                Ok(()) => {
                    let mut slots = self.slots.lock().await;
                    let slot = &mut slots[index];
                    slot.processed.insert(envelope.event_id());
                    slot.checkpoint = slot.checkpoint.max(position);
                    return true;
                }
                Err(error) => {
                    if attempt >= self.config.projection_max_retries {
                        let mut slots = self.slots.lock().await;
                        let slot = &mut slots[index];
                        tracing::error!(
                            projection = slot.projection.name(),
                            event_id = %envelope.event_id(),
                            error = %error,
                            "projection handler exhausted retries, dead-lettering"
                        );
                        slot.dead_letters.push(DeadLetter {
                            event_id: envelope.event_id(),
                            reason: error.0,
                            attempts: attempt + 1,
                            first_seen,
                            last_seen: self.clock.now(),
                        });
                        // Marked processed so redeliveries do not loop.
                        slot.processed.insert(envelope.event_id());
                        slot.checkpoint = slot.checkpoint.max(position);
                        return false;
                    }
                    attempt += 1;
                    tokio::time::sleep(backoff_delay(&self.config, attempt)).await;
                }
            }
        }
    }

    /// Dead letters accumulated by the named projection.
    pub async fn dead_letters(&self, name: &str) -> Vec<DeadLetter> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .find(|s| s.projection.name() == name)
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Checkpoint of the named projection (0 when unknown).
    pub async fn checkpoint(&self, name: &str) -> u64 {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .find(|s| s.projection.name() == name)
            .map(|s| s.checkpoint)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::envelope::AggregateKind;
    use crate::envelope::test_fixtures::envelope;
    use crate::projection::ProjectionError;
    use crate::store::InMemoryEventStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts applied events; fails the first `fail_times` attempts of
    /// every event when configured.
    struct Counting {
        applied: Arc<AtomicU32>,
        fail_times: u32,
        attempts: Arc<AtomicU32>,
    }

    impl Projection for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn apply(&mut self, _envelope: &EventEnvelope) -> Result<(), ProjectionError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                return Err(ProjectionError("induced failure".into()));
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dispatcher_with(fail_times: u32) -> (EventDispatcher, Arc<AtomicU32>) {
        let clock = Arc::new(FixedClock::at(
            DateTime::parse_from_rfc3339("2026-03-01T09:00:00+00:00").expect("valid rfc3339"),
        ));
        let applied = Arc::new(AtomicU32::new(0));
        let mut dispatcher = EventDispatcher::new(
            CoreConfig {
                backoff_base_ms: 1,
                ..CoreConfig::default()
            },
            clock,
        );
        dispatcher.register(Box::new(Counting {
            applied: applied.clone(),
            fail_times,
            attempts: Arc::new(AtomicU32::new(0)),
        }));
        (dispatcher, applied)
    }

    #[tokio::test]
    async fn offer_then_drain_applies_once() {
        let (dispatcher, applied) = dispatcher_with(0);
        let env = envelope(AggregateKind::Symptom, Uuid::new_v4(), 1, "clinical.observation.SymptomReported");
        dispatcher.offer(&env, 1).await;
        dispatcher.offer(&env, 1).await; // duplicate offer
        assert_eq!(dispatcher.drain().await, 1);
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.checkpoint("counting").await, 1);
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let (dispatcher, applied) = dispatcher_with(0);
        let env = envelope(AggregateKind::Symptom, Uuid::new_v4(), 1, "clinical.observation.SymptomReported");
        dispatcher.offer(&env, 1).await;
        dispatcher.drain().await;
        // A catch-up style redelivery of the same event.
        dispatcher.offer(&env, 1).await;
        assert_eq!(dispatcher.drain().await, 0);
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_retried_to_success() {
        let (dispatcher, applied) = dispatcher_with(2);
        let env = envelope(AggregateKind::Symptom, Uuid::new_v4(), 1, "clinical.observation.SymptomReported");
        dispatcher.offer(&env, 1).await;
        assert_eq!(dispatcher.drain().await, 1);
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert!(dispatcher.dead_letters("counting").await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_and_continue() {
        let (dispatcher, applied) = dispatcher_with(u32::MAX);
        let poisoned = envelope(AggregateKind::Symptom, Uuid::new_v4(), 1, "clinical.observation.SymptomReported");
        dispatcher.offer(&poisoned, 1).await;
        assert_eq!(dispatcher.drain().await, 0);

        let letters = dispatcher.dead_letters("counting").await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event_id, poisoned.event_id());
        assert!(letters[0].attempts > 1);
        assert_eq!(applied.load(Ordering::SeqCst), 0);
        // Delivery continues; checkpoint moved past the poisoned event.
        assert_eq!(dispatcher.checkpoint("counting").await, 1);
    }

    #[tokio::test]
    async fn catch_up_pulls_missed_events() {
        let (dispatcher, applied) = dispatcher_with(0);
        let store = InMemoryEventStore::new();
        for _ in 0..3 {
            store
                .append(&envelope(
                    AggregateKind::Symptom,
                    Uuid::new_v4(),
                    1,
                    "clinical.observation.SymptomReported",
                ))
                .expect("append");
        }
        // Nothing was offered live; the poller finds everything.
        dispatcher.catch_up(&store).await;
        assert_eq!(dispatcher.drain().await, 3);
        assert_eq!(applied.load(Ordering::SeqCst), 3);

        // A second catch-up finds nothing new.
        dispatcher.catch_up(&store).await;
        assert_eq!(dispatcher.drain().await, 0);
    }

    #[tokio::test]
    async fn live_and_catch_up_overlap_without_double_apply() {
        let (dispatcher, applied) = dispatcher_with(0);
        let store = InMemoryEventStore::new();
        let env = envelope(AggregateKind::Symptom, Uuid::new_v4(), 1, "clinical.observation.SymptomReported");
        let position = match store.append(&env).expect("append") {
            crate::store::AppendOutcome::Appended(p) => p,
            other => panic!("unexpected outcome: {other:?}"),
        };
        dispatcher.offer(&env, position).await;
        dispatcher.catch_up(&store).await;
        dispatcher.drain().await;
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    use chrono::DateTime;
}
