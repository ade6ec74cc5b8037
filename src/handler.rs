//! The command pipeline: load, rehydrate, check, decide, stamp, append,
//! dispatch.
//!
//! One invocation handles one typed command against one aggregate stream.
//! Writes are serialized per stream by optimistic concurrency alone: if a
//! concurrent writer races us, the append is rejected and the whole
//! pipeline restarts from a fresh read, up to a configured retry budget
//! with jittered exponential backoff. No locks are held across the store.

use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::{Aggregate, DomainError, encode_domain_event, rehydrate};
use crate::clock::Clock;
use crate::command::CommandContext;
use crate::config::{CoreConfig, backoff_delay};
use crate::device::{DeviceSession, Outbox};
use crate::dispatcher::EventDispatcher;
use crate::envelope::{EventEnvelope, EventMetadata, default_visibility};
use crate::invariant::InvariantCode;
use crate::store::{AppendOutcome, EventStore, StoreError};

/// Non-domain failure sources surfaced as `Transient`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransientSource {
    #[error("storage: {0}")]
    Storage(String),
    #[error("deadline exceeded")]
    Deadline,
}

/// Failure of one command execution. Everything is a value; nothing
/// escapes as a panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// A cross-aggregate precondition failed against the local read
    /// models. Possibly stale offline; retry after sync.
    #[error("precondition failed: {code}")]
    Precondition { code: InvariantCode },
    /// The aggregate refused the command. Do not retry mechanically.
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// Optimistic concurrency retries exhausted.
    #[error("concurrency conflict: {retries} retries exhausted")]
    Concurrency { retries: u32 },
    /// Storage failure or deadline; retry with backoff.
    #[error("transient: {0}")]
    Transient(TransientSource),
}

/// Everything a command execution needs besides the command itself.
///
/// Bundled so the per-aggregate entry points in the core stay one line
/// each.
pub struct HandlerEnv<'a> {
    pub store: &'a dyn EventStore,
    pub dispatcher: &'a EventDispatcher,
    pub session: &'a DeviceSession,
    pub outbox: &'a Outbox,
    pub clock: &'a Arc<dyn Clock>,
    pub config: &'a CoreConfig,
}

/// Execute one typed command against one aggregate stream.
///
/// `preconditions` runs the command's cross-aggregate checks against the
/// read models; it is re-evaluated on every retry so a concurrent writer's
/// effect is observed. Returns the stamped, persisted envelopes.
pub async fn execute_command<A>(
    env: &HandlerEnv<'_>,
    aggregate_id: Uuid,
    cmd: A::Command,
    ctx: &CommandContext,
    preconditions: impl Fn() -> Result<(), InvariantCode>,
) -> Result<Vec<EventEnvelope>, CommandError>
where
    A: Aggregate,
    A::Command: Clone,
{
    let correlation_id = ctx.correlation_id.unwrap_or_else(Uuid::new_v4);
    let mut attempt: u32 = 0;

    loop {
        if let Some(deadline) = ctx.deadline
            && env.clock.now() > deadline
        {
            return Err(CommandError::Transient(TransientSource::Deadline));
        }

        // 1-3. Load and rehydrate from a fresh read.
        let stream = env.store.read_stream(A::KIND, aggregate_id);
        let state: A = rehydrate(&stream);

        // 4. Cross-aggregate preconditions against the read models.
        preconditions().map_err(|code| CommandError::Precondition { code })?;

        // 5. Pure decision.
        let events = state.decide(cmd.clone(), env.clock.as_ref())?;
        if events.is_empty() {
            return Ok(vec![]);
        }

        // 6. Stamp metadata and append. A version conflict anywhere
        //    restarts the whole pipeline.
        let base_version = stream.len() as u64;
        let mut persisted = Vec::with_capacity(events.len());
        let mut conflicted = false;
        for (offset, event) in events.iter().enumerate() {
            let (event_type, payload) = encode_domain_event::<A>(event)
                .map_err(|e| CommandError::Transient(TransientSource::Storage(e.to_string())))?;
            let envelope = EventEnvelope {
                metadata: EventMetadata {
                    event_id: Uuid::now_v7(),
                    event_type,
                    schema_version: 1,
                    aggregate_id,
                    aggregate_type: A::KIND,
                    aggregate_version: base_version + offset as u64 + 1,
                    occurred_at: A::occurred_at(&cmd),
                    recorded_at: env.clock.now(),
                    performed_by: ctx.performed_by,
                    performer_role: ctx.performer_role,
                    organization_id: ctx.organization_id,
                    facility_id: ctx.facility_id,
                    device_id: env.session.device_id().to_string(),
                    connection_status: env.session.connection_status(),
                    device_clock_drift_ms: env.session.drift_ms(),
                    local_sequence_number: env.session.next_lsn(),
                    sync_batch_id: None,
                    correlation_id,
                    causation_id: ctx.causation_id,
                    visibility: ctx.visibility.clone().unwrap_or_else(default_visibility),
                },
                payload,
            };

            match env.store.append(&envelope) {
                Ok(AppendOutcome::Appended(position)) => {
                    env.outbox
                        .push(envelope.event_id(), envelope.metadata.local_sequence_number);
                    persisted.push((position, envelope));
                }
                // A fresh v7 id cannot collide; treat like a no-op append.
                Ok(AppendOutcome::Duplicate) => {}
                Err(StoreError::VersionConflict { expected, actual }) => {
                    tracing::debug!(
                        aggregate_type = A::KIND.as_str(),
                        %aggregate_id,
                        expected,
                        actual,
                        attempt,
                        "version conflict, retrying from fresh state"
                    );
                    conflicted = true;
                    break;
                }
                Err(StoreError::Storage(message)) => {
                    return Err(CommandError::Transient(TransientSource::Storage(message)));
                }
            }
        }

        if conflicted {
            if attempt >= env.config.max_retries {
                return Err(CommandError::Concurrency {
                    retries: env.config.max_retries,
                });
            }
            attempt += 1;
            tokio::time::sleep(backoff_delay(env.config, attempt)).await;
            continue;
        }

        // 7. Post-commit: non-blocking hand-off to the dispatcher. The
        //    events are durable regardless; catch-up polling covers any
        //    missed offer.
        for (position, envelope) in &persisted {
            env.dispatcher.offer(envelope, *position).await;
        }
        return Ok(persisted.into_iter().map(|(_, e)| e).collect());
    }
}
