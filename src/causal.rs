//! Deterministic total order over arbitrary event sets: the six-rule
//! hybrid clock.
//!
//! The six rules, first difference wins:
//!
//! 1. Same stream: lower `aggregate_version` first.
//! 2. Causation: a cause precedes its effects, transitively.
//! 3. Same device: lower `local_sequence_number` first.
//! 4. Drift-adjusted `occurred_at`, ascending.
//! 5. `recorded_at`, ascending.
//! 6. `event_id`, ascending (time-sortable tiebreak).
//!
//! Rules 1 to 3 are structural constraints, so they become edges of a
//! precedence graph; rules 4 to 6 form a total key that picks among the
//! ready nodes. The result is the same for any permutation of the input.
//! A cycle is only possible when recorded causation contradicts stream or
//! device order; that is a data-integrity violation reported to the
//! caller, never reordered silently.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use uuid::Uuid;

use crate::envelope::EventEnvelope;

/// Recorded causation contradicts stream or device order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("causal integrity violation involving {} event(s)", involved.len())]
pub struct CausalIntegrityViolation {
    /// Ids of the events trapped in the cycle.
    pub involved: Vec<Uuid>,
}

/// Order `events` by the six-rule hybrid clock.
///
/// Duplicate event ids are collapsed to their first occurrence. The output
/// is a permutation of the (deduplicated) input; it is identical for any
/// shuffle of the same set.
pub fn causal_order(
    events: &[EventEnvelope],
) -> Result<Vec<EventEnvelope>, CausalIntegrityViolation> {
    // Deduplicate by event id, keeping a stable node list.
    let mut nodes: Vec<&EventEnvelope> = Vec::with_capacity(events.len());
    let mut by_id: HashMap<Uuid, usize> = HashMap::with_capacity(events.len());
    for envelope in events {
        if !by_id.contains_key(&envelope.event_id()) {
            by_id.insert(envelope.event_id(), nodes.len());
            nodes.push(envelope);
        }
    }

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut indegree: Vec<usize> = vec![0; nodes.len()];
    let add_edge = |from: usize, to: usize, successors: &mut Vec<Vec<usize>>, indegree: &mut Vec<usize>| {
        successors[from].push(to);
        indegree[to] += 1;
    };

    // Rule 1: stream version order. Events sharing a version (a conflict
    // under resolution) stay unordered here and fall to the key.
    let mut streams: HashMap<(crate::envelope::AggregateKind, Uuid), Vec<usize>> = HashMap::new();
    for (index, envelope) in nodes.iter().enumerate() {
        streams
            .entry((envelope.aggregate_type(), envelope.aggregate_id()))
            .or_default()
            .push(index);
    }
    for group in streams.values_mut() {
        group.sort_by_key(|&i| nodes[i].aggregate_version());
        for window_start in 0..group.len() {
            let from = group[window_start];
            for &to in group[window_start + 1..].iter() {
                if nodes[to].aggregate_version() > nodes[from].aggregate_version() {
                    add_edge(from, to, &mut successors, &mut indegree);
                }
            }
        }
    }

    // Rule 3: per-device LSN order.
    let mut devices: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, envelope) in nodes.iter().enumerate() {
        devices
            .entry(envelope.metadata.device_id.as_str())
            .or_default()
            .push(index);
    }
    for group in devices.values_mut() {
        group.sort_by_key(|&i| nodes[i].metadata.local_sequence_number);
        for pair in group.windows(2) {
            if nodes[pair[1]].metadata.local_sequence_number
                > nodes[pair[0]].metadata.local_sequence_number
            {
                add_edge(pair[0], pair[1], &mut successors, &mut indegree);
            }
        }
    }

    // Rule 2: causation edges, where both ends are present.
    for (index, envelope) in nodes.iter().enumerate() {
        if let Some(cause) = envelope.metadata.causation_id
            && let Some(&cause_index) = by_id.get(&cause)
        {
            add_edge(cause_index, index, &mut successors, &mut indegree);
        }
    }

    // Kahn's algorithm; the ready set is a min-heap keyed by rules 4-6.
    let key = |i: usize| {
        let e = nodes[i];
        (e.adjusted_occurred_at(), e.recorded_at(), e.event_id())
    };
    let mut ready = BinaryHeap::new();
    for (index, &degree) in indegree.iter().enumerate() {
        if degree == 0 {
            ready.push(Reverse((key(index), index)));
        }
    }

    let mut ordered = Vec::with_capacity(nodes.len());
    while let Some(Reverse((_, index))) = ready.pop() {
        ordered.push(nodes[index].clone());
        for &next in &successors[index] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse((key(next), next)));
            }
        }
    }

    if ordered.len() != nodes.len() {
        let placed: std::collections::HashSet<Uuid> =
            ordered.iter().map(EventEnvelope::event_id).collect();
        return Err(CausalIntegrityViolation {
            involved: nodes
                .iter()
                .filter(|e| !placed.contains(&e.event_id()))
                .map(|e| e.event_id())
                .collect(),
        });
    }
    Ok(ordered)
}
