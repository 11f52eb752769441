//! Client-wide rpc-id bookkeeping.
//!
//! Every participant slot of every transaction gets a globally unique 64-bit
//! rpc id; servers deduplicate retried prepares by id, and the recovery
//! manager uses ids to resolve transactions whose client died. Ids are
//! handed out in contiguous blocks, one block per transaction, and released
//! whole when the transaction has informed every participant.

use std::collections::BTreeMap;

/// Allocator for contiguous rpc-id blocks.
///
/// `ack_id` is piggybacked on prepare requests and tells servers the largest
/// id below which every issued id has been released, letting them garbage
/// collect dedup state.
#[derive(Debug)]
pub struct RpcTracker {
    /// Next id to hand out. Ids start at 1; 0 means "none".
    next_rpc_id: u64,
    /// Outstanding blocks, first id -> block length.
    blocks: BTreeMap<u64, u64>,
}

impl RpcTracker {
    pub fn new() -> Self {
        Self {
            next_rpc_id: 1,
            blocks: BTreeMap::new(),
        }
    }

    /// Reserve `len` contiguous ids and return the first.
    ///
    /// A zero-length block is legal (an empty transaction) and is considered
    /// released from the start.
    pub fn new_rpc_id_block(&mut self, len: u64) -> u64 {
        let first = self.next_rpc_id;
        self.next_rpc_id += len;
        if len > 0 {
            self.blocks.insert(first, len);
        }
        first
    }

    /// Largest id below which every issued id has been released.
    pub fn ack_id(&self) -> u64 {
        match self.blocks.keys().next() {
            Some(oldest) => oldest - 1,
            None => self.next_rpc_id - 1,
        }
    }

    /// Release the block starting at `first_id`. Idempotent.
    pub fn rpc_finished(&mut self, first_id: u64) {
        self.blocks.remove(&first_id);
    }

    /// True while any block is outstanding.
    pub fn has_unfinished(&self) -> bool {
        !self.blocks.is_empty()
    }
}

impl Default for RpcTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_contiguous() {
        let mut tracker = RpcTracker::new();
        let first = tracker.new_rpc_id_block(3);
        let second = tracker.new_rpc_id_block(2);
        assert_eq!(first, 1);
        assert_eq!(second, 4);
    }

    #[test]
    fn ack_id_trails_the_oldest_outstanding_block() {
        let mut tracker = RpcTracker::new();
        let a = tracker.new_rpc_id_block(3);
        let b = tracker.new_rpc_id_block(2);
        assert_eq!(tracker.ack_id(), a - 1);

        // Releasing out of order only advances past fully released prefixes.
        tracker.rpc_finished(b);
        assert_eq!(tracker.ack_id(), a - 1);
        tracker.rpc_finished(a);
        assert_eq!(tracker.ack_id(), 5);
        assert!(!tracker.has_unfinished());
    }

    #[test]
    fn empty_block_is_released_from_the_start() {
        let mut tracker = RpcTracker::new();
        let first = tracker.new_rpc_id_block(0);
        assert_eq!(first, 1);
        assert!(!tracker.has_unfinished());
        // Releasing it anyway is a no-op.
        tracker.rpc_finished(first);
        assert_eq!(tracker.ack_id(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let mut tracker = RpcTracker::new();
        let first = tracker.new_rpc_id_block(2);
        tracker.rpc_finished(first);
        tracker.rpc_finished(first);
        assert_eq!(tracker.ack_id(), 2);
    }
}
