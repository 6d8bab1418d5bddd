//! The session's data model (§3): endpoints, streams, and the bookkeeping
//! records the ack and reliability layers operate on.

use std::collections::VecDeque;
use std::time::Instant;

use transport::Endpoint as NetEndpoint;

pub const RECENT_OUTGOING_CAPACITY: usize = 512;
pub const RTT_WINDOW: usize = 8;

/// The four endpoint kinds a caller can hand in, plus the ones discovered
/// mid-call via reflector exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    UdpRelay,
    TcpRelay,
    UdpP2pInet,
    UdpP2pLan,
}

/// One candidate path to the peer. `id` is caller-assigned and stable for
/// the session's lifetime; `rtt_samples` is a rolling window used to
/// compute `average_rtt`.
#[derive(Debug, Clone)]
pub struct CallEndpoint {
    pub id: u64,
    pub kind: EndpointKind,
    pub net: NetEndpoint,
    pub peer_tag: [u8; 16],
    pub rtt_samples: VecDeque<f64>,
    pub last_ping_seq: u32,
    pub last_ping_send_time: Option<Instant>,
    pub pong_count: u32,
}

impl CallEndpoint {
    pub fn new(id: u64, kind: EndpointKind, net: NetEndpoint, peer_tag: [u8; 16]) -> Self {
        Self {
            id,
            kind,
            net,
            peer_tag,
            rtt_samples: VecDeque::with_capacity(RTT_WINDOW),
            last_ping_seq: 0,
            last_ping_send_time: None,
            pong_count: 0,
        }
    }

    pub fn record_rtt(&mut self, sample: f64) {
        if self.rtt_samples.len() == RTT_WINDOW {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(sample);
    }

    pub fn average_rtt(&self) -> Option<f64> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        Some(self.rtt_samples.iter().sum::<f64>() / self.rtt_samples.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

/// A per-direction stream descriptor. Incoming streams own a jitter
/// buffer and decoder; outgoing streams are driven by the encoder.
pub struct Stream {
    pub id: u8,
    pub kind: StreamKind,
    pub codec: u32,
    pub enabled: bool,
    pub frame_duration_ms: u32,
    pub extra_ec: bool,
    pub jitter_buffer: Option<jitter::JitterBuffer>,
}

impl Stream {
    pub fn outgoing(id: u8, kind: StreamKind, codec: u32, frame_duration_ms: u32) -> Self {
        Self {
            id,
            kind,
            codec,
            enabled: true,
            frame_duration_ms,
            extra_ec: false,
            jitter_buffer: None,
        }
    }

    pub fn incoming(id: u8, kind: StreamKind, codec: u32, frame_duration_ms: u32) -> Self {
        Self {
            id,
            kind,
            codec,
            enabled: true,
            frame_duration_ms,
            extra_ec: false,
            jitter_buffer: Some(jitter::JitterBuffer::new(frame_duration_ms)),
        }
    }
}

/// One packet we sent, tracked until acked or evicted from the ring.
#[derive(Debug, Clone)]
pub struct RecentOutgoingPacket {
    pub seq: u32,
    pub send_time: Instant,
    pub ack_time: Option<Instant>,
    pub size: usize,
}

/// An item on the reliable-extras channel (`SendPacketReliably`, used by
/// peers below protocol version 6).
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub kind: u8,
    pub payload: Vec<u8>,
    pub seqs: Vec<u32>,
    pub first_send_time: Instant,
    pub last_send_time: Instant,
    pub retry_interval: std::time::Duration,
    pub timeout_at: Instant,
}

impl QueuedPacket {
    pub const MAX_SEQS: usize = 16;

    pub fn record_send(&mut self, seq: u32, now: Instant) {
        if self.seqs.len() == Self::MAX_SEQS {
            self.seqs.remove(0);
        }
        self.seqs.push(seq);
        self.last_send_time = now;
    }

    pub fn acked_by(&self, acked: &[u32]) -> bool {
        self.seqs.iter().any(|s| acked.contains(s))
    }
}

/// An extra attached inline to outgoing packets until the peer acks it
/// (peer protocol >= 6); retired once `lastRemoteAckSeq >=
/// first_containing_seq`.
#[derive(Debug, Clone)]
pub struct UnacknowledgedExtraData {
    pub kind: u8,
    pub payload: Vec<u8>,
    pub first_containing_seq: u32,
    pub content_hash: [u8; 20],
}
