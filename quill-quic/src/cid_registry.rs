//! Pools of active connection IDs, one per direction
//!
//! Each connection tracks two of these: the IDs the peer issued to us (stamped
//! into outgoing packet headers) and the IDs we issued to the peer (validated
//! against RETIRE_CONNECTION_ID). Pool sizes are bounded by the negotiated
//! `active_connection_id_limit`, so linear scans are fine.

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::shared::{ConnectionId, ResetToken};

/// A connection ID and its attributes, immutable once issued
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct CidEntry {
    pub(crate) id: ConnectionId,
    pub(crate) sequence: u64,
    pub(crate) reset_token: Option<ResetToken>,
}

/// Bounded pool of usable connection IDs for one direction
#[derive(Debug)]
pub(crate) struct CidRegistry {
    capacity: usize,
    entries: Vec<CidEntry>,
    retired: FxHashSet<u64>,
    /// All sequence numbers below this are retired; monotonically non-decreasing
    retire_prior_to: u64,
    /// Round-robin cursor for `next_active`
    cursor: usize,
}

impl CidRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::new(),
            retired: FxHashSet::default(),
            retire_prior_to: 0,
            cursor: 0,
        }
    }

    /// Resize the pool once the peer's `active_connection_id_limit` is known
    ///
    /// Registries are constructed with a placeholder capacity before the
    /// handshake delivers the negotiated limits.
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        debug_assert!(capacity >= self.entries.len());
        self.capacity = capacity;
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn retire_prior_to(&self) -> u64 {
        self.retire_prior_to
    }

    /// Add an entry, unless the pool is full
    ///
    /// Returns `false` and leaves the pool untouched when at capacity. Never
    /// overwrites: callers must look up the sequence number first.
    pub(crate) fn insert(&mut self, entry: CidEntry) -> bool {
        debug_assert!(self.by_sequence(entry.sequence).is_none());
        debug_assert!(!self.retired.contains(&entry.sequence));
        debug_assert!(entry.sequence >= self.retire_prior_to);
        if self.entries.len() == self.capacity {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub(crate) fn by_sequence(&self, sequence: u64) -> Option<&CidEntry> {
        self.entries.iter().find(|e| e.sequence == sequence)
    }

    pub(crate) fn by_id(&self, id: &ConnectionId) -> Option<&CidEntry> {
        self.entries.iter().find(|e| e.id == *id)
    }

    pub(crate) fn is_retired(&self, sequence: u64) -> bool {
        self.retired.contains(&sequence)
    }

    /// Remove the entry for `sequence`, if any, and remember it as retired
    ///
    /// Idempotent; retiring an unknown sequence number still records it so a
    /// late-arriving entry is not resurrected.
    pub(crate) fn retire(&mut self, sequence: u64) {
        if let Some(i) = self.entries.iter().position(|e| e.sequence == sequence) {
            self.entries.remove(i);
            if self.cursor > i {
                self.cursor -= 1;
            }
        }
        self.retired.insert(sequence);
    }

    /// Retire every entry below `threshold` and raise the threshold
    ///
    /// Returns the newly retired sequence numbers, in issue order. A threshold
    /// at or below the current one is a no-op.
    pub(crate) fn advance_retirement(&mut self, threshold: u64) -> Vec<u64> {
        if threshold <= self.retire_prior_to {
            return Vec::new();
        }
        let mut newly_retired = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].sequence < threshold {
                let entry = self.entries.remove(i);
                if self.cursor > i {
                    self.cursor -= 1;
                }
                trace!(sequence = entry.sequence, "retiring CID below threshold");
                self.retired.insert(entry.sequence);
                newly_retired.push(entry.sequence);
            } else {
                i += 1;
            }
        }
        newly_retired.sort_unstable();
        self.retire_prior_to = threshold;
        newly_retired
    }

    /// The ID to stamp into the next outgoing packet header
    ///
    /// Round-robins through the live pool; `None` iff the pool is empty.
    pub(crate) fn next_active(&mut self) -> Option<ConnectionId> {
        if self.entries.is_empty() {
            return None;
        }
        self.cursor %= self.entries.len();
        let id = self.entries[self.cursor].id;
        self.cursor = (self.cursor + 1) % self.entries.len();
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sequence: u64) -> CidEntry {
        CidEntry {
            id: ConnectionId::new(&[sequence as u8; 8]),
            sequence,
            reset_token: Some([0xcd; crate::RESET_TOKEN_SIZE].into()),
        }
    }

    #[test]
    fn capacity_is_enforced() {
        let mut reg = CidRegistry::new(3);
        for seq in 0..3 {
            assert!(reg.insert(entry(seq)));
        }
        assert!(!reg.insert(entry(3)));
        assert_eq!(reg.len(), 3);
        assert!(reg.by_sequence(3).is_none());
    }

    #[test]
    fn retirement_is_idempotent() {
        let mut reg = CidRegistry::new(4);
        reg.insert(entry(0));
        reg.insert(entry(1));
        reg.retire(1);
        assert!(reg.is_retired(1));
        assert!(reg.by_sequence(1).is_none());
        reg.retire(1);
        assert_eq!(reg.len(), 1);
        // Space freed by retirement is reusable
        assert!(reg.insert(entry(2)));
    }

    #[test]
    fn advance_retirement_drains_below_threshold() {
        let mut reg = CidRegistry::new(8);
        for seq in 0..5 {
            reg.insert(entry(seq));
        }
        assert_eq!(reg.advance_retirement(3), vec![0, 1, 2]);
        assert_eq!(reg.retire_prior_to(), 3);
        for seq in 0..3 {
            assert!(reg.is_retired(seq));
            assert!(reg.by_sequence(seq).is_none());
        }
        assert!(reg.by_sequence(3).is_some());

        // Not exceeding the current threshold: no-op
        assert_eq!(reg.advance_retirement(3), Vec::<u64>::new());
        assert_eq!(reg.advance_retirement(1), Vec::<u64>::new());
        assert_eq!(reg.retire_prior_to(), 3);
    }

    #[test]
    fn round_robin_cycles_live_entries() {
        let mut reg = CidRegistry::new(4);
        assert_eq!(reg.next_active(), None);
        reg.insert(entry(0));
        reg.insert(entry(1));
        let a = reg.next_active().unwrap();
        let b = reg.next_active().unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.next_active().unwrap(), a);

        reg.retire(0);
        assert_eq!(reg.next_active().unwrap(), entry(1).id);
        assert_eq!(reg.next_active().unwrap(), entry(1).id);
    }

    #[test]
    fn lookup_by_id() {
        let mut reg = CidRegistry::new(2);
        reg.insert(entry(7));
        assert_eq!(reg.by_id(&entry(7).id).unwrap().sequence, 7);
        assert!(reg.by_id(&entry(9).id).is_none());
    }
}
