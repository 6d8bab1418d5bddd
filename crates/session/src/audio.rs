//! Audio pipeline glue (§4.11). The codec, AEC/NS/AGC chain, and platform
//! audio I/O live outside this crate; `AudioEncoder`/`AudioDecoder` are the
//! traits that let the session drive them without depending on any of
//! their concrete implementations.

use jitter::JitterBuffer;

/// One encoded frame pair: the primary payload plus, when Shitty-Internet
/// mode is active, a lower-bitrate secondary encoding for `PKT_STREAM_EC`.
pub struct EncodedFrame {
    pub primary: Vec<u8>,
    pub secondary: Option<Vec<u8>>,
    pub timestamp: u32,
}

/// Encoder-side contract: pushed raw PCM in, encoded frames out.
pub trait AudioEncoder: Send {
    fn encode(&mut self, pcm: &[i16], timestamp: u32) -> EncodedFrame;
}

/// Decoder-side contract: bound to a jitter buffer, produces PCM per
/// output callback.
pub trait AudioDecoder: Send {
    fn decode(&mut self, jitter_buffer: &JitterBuffer) -> (Vec<i16>, u32);
}

/// A deterministic pass-through encoder for tests: emits the input PCM
/// reinterpreted as bytes, no real compression. Matches the "deterministic
/// passthrough test double" required by §4.11/§13.
pub struct PassthroughEncoder;

impl AudioEncoder for PassthroughEncoder {
    fn encode(&mut self, pcm: &[i16], timestamp: u32) -> EncodedFrame {
        let mut bytes = Vec::with_capacity(pcm.len() * 2);
        for sample in pcm {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        EncodedFrame { primary: bytes, secondary: None, timestamp }
    }
}

/// The decoder half of [`PassthroughEncoder`]: pulls raw bytes out of the
/// jitter buffer and reinterprets them as `i16` PCM.
pub struct PassthroughDecoder;

impl AudioDecoder for PassthroughDecoder {
    fn decode(&mut self, jitter_buffer: &JitterBuffer) -> (Vec<i16>, u32) {
        let (outcome, playback_scaled_duration) = jitter_buffer.handle_output(0);
        let pcm = match outcome {
            jitter::GetOutcome::Ok { data, .. } => data
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
            jitter::GetOutcome::Missing | jitter::GetOutcome::Buffering => Vec::new(),
        };
        (pcm, playback_scaled_duration)
    }
}
