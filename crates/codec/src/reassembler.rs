//! Fragment-to-packet aggregation by `(timestamp, fragmentIndex)`.
//!
//! Not wired into the audio path (the core is audio-only and every audio
//! frame is a single fragment); kept standalone because its contract is
//! exercised by the wire format and reserved for a future video path, per
//! the original `PacketReassembler`.

const MAX_FRAGMENTS: usize = 255;

struct InFlight {
    timestamp: u32,
    fragment_count: usize,
    is_keyframe: bool,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

#[derive(Default)]
pub struct PacketReassembler {
    current: Option<InFlight>,
}

pub struct ReassembledPacket {
    pub bytes: Vec<u8>,
    pub timestamp: u32,
    pub is_keyframe: bool,
}

impl PacketReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Adds one fragment. If `fragment_count <= 1` this returns the
    /// packet immediately without buffering. Starting a fragment set for a
    /// new timestamp discards any fragments still in flight for the
    /// previous one.
    pub fn add_fragment(
        &mut self,
        bytes: &[u8],
        fragment_index: usize,
        fragment_count: usize,
        timestamp: u32,
        is_keyframe: bool,
    ) -> Option<ReassembledPacket> {
        if fragment_count <= 1 {
            return Some(ReassembledPacket {
                bytes: bytes.to_vec(),
                timestamp,
                is_keyframe,
            });
        }

        let fragment_count = fragment_count.min(MAX_FRAGMENTS);
        if fragment_index >= fragment_count {
            return None;
        }

        let needs_new = match &self.current {
            Some(inflight) => inflight.timestamp != timestamp,
            None => true,
        };
        if needs_new {
            self.current = Some(InFlight {
                timestamp,
                fragment_count,
                is_keyframe,
                parts: vec![None; fragment_count],
                received: 0,
            });
        }

        let inflight = self.current.as_mut().unwrap();
        if inflight.parts[fragment_index].is_none() {
            inflight.parts[fragment_index] = Some(bytes.to_vec());
            inflight.received += 1;
        }

        if inflight.received == inflight.fragment_count {
            let inflight = self.current.take().unwrap();
            let mut out = Vec::new();
            for part in inflight.parts.into_iter() {
                out.extend_from_slice(&part.expect("all parts present by construction"));
            }
            Some(ReassembledPacket {
                bytes: out,
                timestamp: inflight.timestamp,
                is_keyframe: inflight.is_keyframe,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_fragment_emits_immediately() {
        let mut r = PacketReassembler::new();
        let out = r.add_fragment(b"hello", 0, 1, 10, false).unwrap();
        assert_eq!(out.bytes, b"hello");
    }

    #[test]
    fn waits_for_all_fragments_in_index_order() {
        let mut r = PacketReassembler::new();
        assert!(r.add_fragment(b"world", 1, 2, 10, false).is_none());
        let out = r.add_fragment(b"hello ", 0, 2, 10, false).unwrap();
        assert_eq!(out.bytes, b"hello world");
        assert_eq!(out.timestamp, 10);
    }

    #[test]
    fn new_timestamp_discards_in_flight_reassembly() {
        let mut r = PacketReassembler::new();
        assert!(r.add_fragment(b"stale", 0, 2, 10, false).is_none());
        assert!(r.add_fragment(b"a", 0, 2, 20, false).is_none());
        let out = r.add_fragment(b"b", 1, 2, 20, false).unwrap();
        assert_eq!(out.bytes, b"ab");
    }
}
