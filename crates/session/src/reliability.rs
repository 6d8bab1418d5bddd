//! `SendPacketReliably` (§4.9 "Reliability layer"): used by peers below
//! protocol version 6 for LAN-endpoint and network-changed notifications,
//! where there's no inline-extras channel to piggyback on instead.

use std::time::{Duration, Instant};

use crate::data::QueuedPacket;

/// Holds every in-flight reliable send. The timer sweep re-enqueues each
/// entry on its retry interval until any of its sequences is acked or its
/// deadline elapses.
#[derive(Default)]
pub struct ReliabilityQueue {
    pending: Vec<QueuedPacket>,
}

impl ReliabilityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, kind: u8, payload: Vec<u8>, retry_interval: Duration, timeout: Duration, now: Instant) {
        self.pending.push(QueuedPacket {
            kind,
            payload,
            seqs: Vec::new(),
            first_send_time: now,
            last_send_time: now,
            retry_interval,
            timeout_at: now + timeout,
        });
    }

    /// Removes every queued packet whose sequence set intersects `acked`.
    pub fn retire_acked(&mut self, acked: &[u32]) {
        self.pending.retain(|p| !p.acked_by(acked));
    }

    /// Removes every queued packet whose deadline has elapsed, returning
    /// them so the caller can log/report the failure.
    pub fn drop_expired(&mut self, now: Instant) -> Vec<QueuedPacket> {
        let (expired, remaining): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|p| p.timeout_at <= now);
        self.pending = remaining;
        expired
    }

    /// Returns the packets due for a retransmit at `now` (one
    /// `retry_interval` since their last send), stamping a fresh send with
    /// `assign_seq` and recording it. The assigned sequence is returned
    /// alongside each packet so the caller can build the wire block with
    /// the exact same sequence this queue just recorded.
    pub fn due_for_retry(&mut self, now: Instant, mut assign_seq: impl FnMut() -> u32) -> Vec<(u8, Vec<u8>, u32)> {
        let mut out = Vec::new();
        for packet in self.pending.iter_mut() {
            if now.duration_since(packet.last_send_time) >= packet.retry_interval {
                let seq = assign_seq();
                packet.record_send(seq, now);
                out.push((packet.kind, packet.payload.clone(), seq));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retire_acked_removes_matching_packets() {
        let mut q = ReliabilityQueue::new();
        let now = Instant::now();
        q.enqueue(1, vec![1, 2, 3], Duration::from_millis(500), Duration::from_secs(5), now);
        let mut next_seq = 10u32;
        q.due_for_retry(now + Duration::from_millis(500), || {
            next_seq += 1;
            next_seq
        });
        assert_eq!(q.len(), 1);
        q.retire_acked(&[11]);
        assert!(q.is_empty());
    }

    #[test]
    fn expired_packets_are_dropped() {
        let mut q = ReliabilityQueue::new();
        let now = Instant::now();
        q.enqueue(1, vec![], Duration::from_millis(100), Duration::from_secs(1), now);
        let later = now + Duration::from_secs(2);
        let expired = q.drop_expired(later);
        assert_eq!(expired.len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn retry_only_fires_after_interval_elapses() {
        let mut q = ReliabilityQueue::new();
        let now = Instant::now();
        q.enqueue(1, vec![], Duration::from_millis(500), Duration::from_secs(5), now);
        let mut seq = 0u32;
        let too_soon = q.due_for_retry(now + Duration::from_millis(100), || {
            seq += 1;
            seq
        });
        assert!(too_soon.is_empty());
        let due = q.due_for_retry(now + Duration::from_millis(500), || {
            seq += 1;
            seq
        });
        assert_eq!(due.len(), 1);
    }
}
