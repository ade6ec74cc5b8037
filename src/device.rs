//! Device-side singletons: the local sequence counter, the clock-drift
//! estimate, and the outbox of unsynced events.
//!
//! Both types are created once per device by the core builder and injected
//! everywhere else; tests construct their own. The LSN counter is strictly
//! monotonic and never reused, so per-device ordering survives any
//! interleaving of offline work and sync.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use uuid::Uuid;

use crate::envelope::ConnectionStatus;

/// Per-device identity and counters.
#[derive(Debug)]
pub struct DeviceSession {
    device_id: String,
    /// Last issued LSN; 0 means none issued yet.
    lsn: AtomicU64,
    /// Drift against the hub in milliseconds, updated by each handshake.
    drift_ms: AtomicI64,
    /// Whether the device currently believes itself online.
    online: std::sync::atomic::AtomicBool,
}

impl DeviceSession {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            lsn: AtomicU64::new(0),
            drift_ms: AtomicI64::new(0),
            online: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Issue the next local sequence number, starting at 1.
    pub fn next_lsn(&self) -> u64 {
        self.lsn.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The last issued LSN (0 when none).
    pub fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::SeqCst)
    }

    pub fn drift_ms(&self) -> i64 {
        self.drift_ms.load(Ordering::SeqCst)
    }

    /// Persist the drift computed by the hub during handshake.
    pub fn set_drift_ms(&self, drift: i64) {
        self.drift_ms.store(drift, Ordering::SeqCst);
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        if self.online.load(Ordering::SeqCst) {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        }
    }

    pub fn set_connection_status(&self, status: ConnectionStatus) {
        self.online
            .store(status == ConnectionStatus::Online, Ordering::SeqCst);
    }
}

/// One locally persisted but unsynced event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxEntry {
    pub event_id: Uuid,
    pub lsn: u64,
}

/// Ordered queue of locally persisted but unsynced events.
///
/// Entries are pushed in LSN order by the command handler and pruned when
/// the hub acknowledges them. Pruning is idempotent: acknowledging an
/// already-pruned id is a no-op.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: Mutex<VecDeque<OutboxEntry>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly appended local event.
    pub fn push(&self, event_id: Uuid, lsn: u64) {
        let mut entries = self.entries.lock().expect("outbox mutex poisoned");
        debug_assert!(
            entries.back().is_none_or(|last| last.lsn < lsn),
            "outbox entries must arrive in LSN order"
        );
        entries.push_back(OutboxEntry { event_id, lsn });
    }

    /// Pending entries in LSN order, up to `limit`.
    pub fn pending(&self, limit: usize) -> Vec<OutboxEntry> {
        let entries = self.entries.lock().expect("outbox mutex poisoned");
        entries.iter().take(limit).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("outbox mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry whose id was acknowledged. Unknown ids are
    /// ignored.
    pub fn prune(&self, acknowledged: &[Uuid]) {
        let mut entries = self.entries.lock().expect("outbox mutex poisoned");
        entries.retain(|entry| !acknowledged.contains(&entry.event_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_starts_at_one_and_increases() {
        let session = DeviceSession::new("tablet-1");
        assert_eq!(session.current_lsn(), 0);
        assert_eq!(session.next_lsn(), 1);
        assert_eq!(session.next_lsn(), 2);
        assert_eq!(session.current_lsn(), 2);
    }

    #[test]
    fn drift_round_trips() {
        let session = DeviceSession::new("tablet-1");
        session.set_drift_ms(-1500);
        assert_eq!(session.drift_ms(), -1500);
    }

    #[test]
    fn outbox_preserves_lsn_order() {
        let outbox = Outbox::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            outbox.push(*id, i as u64 + 1);
        }
        let pending = outbox.pending(10);
        assert_eq!(pending.len(), 3);
        assert!(pending.windows(2).all(|w| w[0].lsn < w[1].lsn));
    }

    #[test]
    fn prune_is_idempotent() {
        let outbox = Outbox::new();
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();
        outbox.push(drop, 1);
        outbox.push(keep, 2);

        outbox.prune(&[drop]);
        assert_eq!(outbox.len(), 1);
        outbox.prune(&[drop]);
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.pending(10)[0].event_id, keep);
    }

    #[test]
    fn pending_respects_limit() {
        let outbox = Outbox::new();
        for i in 0..5 {
            outbox.push(Uuid::new_v4(), i + 1);
        }
        assert_eq!(outbox.pending(2).len(), 2);
    }
}
