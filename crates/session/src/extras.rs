//! Inline extras channel (§4.9 "Extras", §8 invariant 4): retried in every
//! outgoing packet until acked, de-duplicated on receive by SHA-1 of the
//! extra's bytes so the same logical extra applied twice (e.g. after a
//! retransmit race) only takes effect once.

use std::collections::HashSet;

use codec::crypto::{CryptoProvider, DefaultCrypto};

use crate::data::UnacknowledgedExtraData;

/// Tracks extras we've sent (retried until acked) and extras we've applied
/// from the peer (so a duplicate delivery is a no-op).
pub struct ExtrasTracker {
    crypto: Box<dyn CryptoProvider>,
    outgoing: Vec<UnacknowledgedExtraData>,
    applied_hashes: HashSet<[u8; 20]>,
}

impl Default for ExtrasTracker {
    fn default() -> Self {
        Self {
            crypto: Box::new(DefaultCrypto),
            outgoing: Vec::new(),
            applied_hashes: HashSet::new(),
        }
    }
}

impl ExtrasTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_outgoing(&mut self, kind: u8, payload: Vec<u8>, first_containing_seq: u32) {
        let mut hash_input = vec![kind];
        hash_input.extend_from_slice(&payload);
        let content_hash = self.crypto.sha1(&hash_input);
        self.outgoing.push(UnacknowledgedExtraData {
            kind,
            payload,
            first_containing_seq,
            content_hash,
        });
    }

    /// Every extra still pending an ack; the caller attaches these to the
    /// next outgoing packet.
    pub fn pending(&self) -> &[UnacknowledgedExtraData] {
        &self.outgoing
    }

    /// Retires every pending extra whose `first_containing_seq` is
    /// covered by `last_remote_ack_seq`.
    pub fn retire_acked(&mut self, last_remote_ack_seq: u32) {
        self.outgoing.retain(|e| e.first_containing_seq > last_remote_ack_seq);
    }

    /// Applies an incoming extra exactly once: returns `true` the first
    /// time a given `(kind, payload)` is seen, `false` on every repeat.
    pub fn should_apply(&mut self, kind: u8, payload: &[u8]) -> bool {
        let mut hash_input = vec![kind];
        hash_input.extend_from_slice(payload);
        let hash = self.crypto.sha1(&hash_input);
        self.applied_hashes.insert(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_extra_is_applied_once() {
        let mut tracker = ExtrasTracker::new();
        assert!(tracker.should_apply(1, b"lan endpoint"));
        assert!(!tracker.should_apply(1, b"lan endpoint"));
    }

    #[test]
    fn different_payloads_are_distinct() {
        let mut tracker = ExtrasTracker::new();
        assert!(tracker.should_apply(1, b"a"));
        assert!(tracker.should_apply(1, b"b"));
    }

    #[test]
    fn retire_acked_drops_only_covered_extras() {
        let mut tracker = ExtrasTracker::new();
        tracker.queue_outgoing(1, b"x".to_vec(), 10);
        tracker.queue_outgoing(1, b"y".to_vec(), 20);
        tracker.retire_acked(15);
        assert_eq!(tracker.pending().len(), 1);
        assert_eq!(tracker.pending()[0].first_containing_seq, 20);
    }
}
