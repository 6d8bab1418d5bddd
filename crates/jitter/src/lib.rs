//! ## Adaptive playout jitter buffer
//!
//! Grounded directly on `JitterBuffer`: a 64-slot ring keyed by sender
//! timestamp, a target occupancy (`minDelay`) that adapts to the observed
//! arrival-time jitter, and a playback-duration hint the decoder uses to
//! stretch or compress audio by small amounts rather than glitching.

use std::time::Instant;

use parking_lot::Mutex;

const SLOT_COUNT: usize = 64;
const HISTORY_LEN: usize = 64;

/// Per-`step` defaults (§4.7): 20 ms frames buffer less aggressively in
/// slot count but tolerate a larger `maxMinDelay` swing; 60 ms frames need
/// very little cushioning.
#[derive(Debug, Clone, Copy)]
struct StepTuneables {
    min_min_delay: u32,
    max_min_delay: u32,
    max_used_slots: u32,
}

fn tuneables_for_step(step_ms: u32) -> StepTuneables {
    if step_ms < 30 {
        StepTuneables { min_min_delay: 6, max_min_delay: 25, max_used_slots: 50 }
    } else if step_ms < 50 {
        StepTuneables { min_min_delay: 4, max_min_delay: 15, max_used_slots: 30 }
    } else {
        StepTuneables { min_min_delay: 1, max_min_delay: 10, max_used_slots: 20 }
    }
}

const LOSSES_TO_RESET: u32 = 20;
const RESYNC_THRESHOLD: f64 = 1.0;

struct Slot {
    timestamp: i64,
    data: Vec<u8>,
    is_ec: bool,
}

/// Outcome of [`JitterBuffer::get`] / the `Get` half of
/// [`JitterBuffer::handle_output`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Ok { data: Vec<u8>, is_ec: bool },
    Missing,
    Buffering,
}

struct Inner {
    slots: Vec<Option<Slot>>,
    next_timestamp: i64,
    step: u32,
    tuneables: StepTuneables,

    min_delay: f64,
    last_put_timestamp: u32,

    lost_count: u32,
    lost_since_reset: u32,
    got_since_reset: u32,
    was_reset: bool,
    needs_buffering: bool,

    delay_history: [i32; HISTORY_LEN],
    late_history: [i32; HISTORY_LEN],
    late_packet_count: u32,

    dont_inc_min_delay: u32,
    dont_dec_min_delay: u32,
    lost_packets: i32,

    prev_recv_time: f64,
    expect_next_at_time: f64,
    deviation_history: [f64; HISTORY_LEN],
    deviation_ptr: usize,

    last_measured_jitter: f64,
    last_measured_delay: u32,
    outstanding_delay_change: i32,
    dont_change_delay: u32,
    avg_delay: f64,

    epoch: Instant,
}

impl Inner {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn current_delay(&self) -> u32 {
        self.slots.iter().filter(|s| s.is_some()).count() as u32
    }

    fn reset(&mut self) {
        self.was_reset = true;
        self.needs_buffering = true;
        self.last_put_timestamp = 0;
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.delay_history = [0; HISTORY_LEN];
        self.late_history = [0; HISTORY_LEN];
        self.lost_since_reset = 0;
        self.got_since_reset = 0;
        self.expect_next_at_time = 0.0;
        self.deviation_history = [0.0; HISTORY_LEN];
        self.deviation_ptr = 0;
        self.outstanding_delay_change = 0;
        self.dont_change_delay = 0;
    }

    fn advance(&mut self) {
        self.next_timestamp += self.step as i64;
    }

    fn put(&mut self, data: &[u8], timestamp: u32, is_ec: bool) {
        self.got_since_reset += 1;

        if self.was_reset {
            self.was_reset = false;
            self.outstanding_delay_change = 0;
            self.next_timestamp = timestamp as i64 - self.step as i64 * self.min_delay.round() as i64;
            log::info!(
                "jitter: resyncing, next timestamp = {} (step={}, minDelay={})",
                self.next_timestamp,
                self.step,
                self.min_delay
            );
        }

        for slot in self.slots.iter_mut() {
            if let Some(s) = slot {
                if s.timestamp < self.next_timestamp - 1 {
                    *slot = None;
                }
            }
        }

        let time = self.now();
        if self.expect_next_at_time != 0.0 {
            let dev = self.expect_next_at_time - time;
            self.deviation_history[self.deviation_ptr] = dev;
            self.deviation_ptr = (self.deviation_ptr + 1) % HISTORY_LEN;
            self.expect_next_at_time += self.step as f64 / 1000.0;
        } else {
            self.expect_next_at_time = time + self.step as f64 / 1000.0;
        }

        let ts = timestamp as i64;
        if ts < self.next_timestamp - 1 {
            log::warn!("jitter: dropping packet with timestamp {timestamp} because it is too late");
            self.late_packet_count += 1;
            return;
        } else if ts < self.next_timestamp {
            log::warn!("jitter: would drop packet with timestamp {timestamp} because it is late but not hopelessly");
            self.late_packet_count += 1;
            self.lost_packets -= 1;
        }

        if timestamp > self.last_put_timestamp {
            self.last_put_timestamp = timestamp;
        }

        let mut target = self.slots.iter().position(|s| s.is_none());
        if target.is_none() || self.current_delay() >= self.tuneables.max_used_slots {
            let evict = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|s| (i, s.timestamp)))
                .min_by_key(|&(_, ts)| ts)
                .map(|(i, _)| i);
            if let Some(i) = evict {
                self.advance();
                self.slots[i] = None;
                target = Some(i);
            }
        }

        if let Some(i) = target {
            self.slots[i] = Some(Slot { timestamp: ts, data: data.to_vec(), is_ec });
        }
        self.prev_recv_time = time;
    }

    fn get(&mut self, offset_in_steps: i32, advance: bool) -> GetOutcome {
        let timestamp_to_get = self.next_timestamp + offset_in_steps as i64 * self.step as i64;
        let found = self.slots.iter().position(|s| matches!(s, Some(slot) if slot.timestamp == timestamp_to_get));

        if let Some(i) = found {
            let slot = self.slots[i].take().unwrap();
            if advance && offset_in_steps == 0 {
                self.advance();
            }
            self.lost_count = 0;
            self.needs_buffering = false;
            return GetOutcome::Ok { data: slot.data, is_ec: slot.is_ec };
        }

        if advance && offset_in_steps == 0 {
            self.advance();
        }

        if self.needs_buffering {
            return GetOutcome::Buffering;
        }

        self.lost_count += 1;
        if offset_in_steps == 0 {
            self.lost_packets += 1;
            self.lost_since_reset += 1;
        }

        let min_delay_frames = self.min_delay.round() as u32;
        if self.lost_count >= LOSSES_TO_RESET
            || (self.got_since_reset > min_delay_frames * 25 && self.lost_since_reset > self.got_since_reset / 2)
        {
            log::warn!("jitter: lost {} packets in a row, resetting", self.lost_count);
            self.dont_inc_min_delay = 16;
            self.dont_dec_min_delay += 128;
            let current_delay = self.current_delay();
            if current_delay < min_delay_frames {
                self.next_timestamp -= (min_delay_frames - current_delay) as i64;
            }
            self.lost_count = 0;
            self.reset();
        }

        GetOutcome::Missing
    }

    fn tick(&mut self) {
        self.late_history.copy_within(0..HISTORY_LEN - 1, 1);
        self.late_history[0] = self.late_packet_count as i32;
        self.late_packet_count = 0;

        let mut avg_late_16 = 0.0;
        let mut absolutely_no_late_packets = true;
        for (i, &v) in self.late_history.iter().enumerate() {
            if i < 16 {
                avg_late_16 += v as f64;
            }
            if v > 0 {
                absolutely_no_late_packets = false;
            }
        }
        avg_late_16 /= 16.0;

        if avg_late_16 >= RESYNC_THRESHOLD {
            self.was_reset = true;
        }

        if absolutely_no_late_packets && self.dont_dec_min_delay > 0 {
            self.dont_dec_min_delay -= 1;
        }

        self.delay_history.copy_within(0..HISTORY_LEN - 1, 1);
        self.delay_history[0] = self.current_delay() as i32;

        let mut avg_delay = 0.0;
        for &v in self.delay_history.iter().take(32) {
            avg_delay += v as f64;
        }
        avg_delay /= 32.0;
        self.avg_delay = avg_delay;

        let avgdev: f64 = self.deviation_history.iter().sum::<f64>() / HISTORY_LEN as f64;
        let variance: f64 = self
            .deviation_history
            .iter()
            .map(|d| (d - avgdev) * (d - avgdev))
            .sum::<f64>()
            / HISTORY_LEN as f64;
        let stddev = variance.sqrt();

        let mut stddev_delay = (stddev * 2.0 * 1000.0 / self.step as f64).ceil() as i64;
        stddev_delay = stddev_delay.clamp(self.tuneables.min_min_delay as i64, self.tuneables.max_min_delay as i64);

        let min_delay_int = self.min_delay.round() as i64;
        if stddev_delay != min_delay_int {
            let mut diff = stddev_delay - min_delay_int;
            if diff > 0 {
                self.dont_dec_min_delay = 100;
            }
            diff = diff.clamp(-1, 1);
            if (diff > 0 && self.dont_inc_min_delay == 0) || (diff < 0 && self.dont_dec_min_delay == 0) {
                self.min_delay += diff as f64;
                self.outstanding_delay_change += diff as i32 * 60;
                self.dont_change_delay += 32;
                log::debug!("new delay from stddev {}", self.min_delay);
                if diff < 0 {
                    self.dont_dec_min_delay += 25;
                }
                if diff > 0 {
                    self.dont_inc_min_delay = 25;
                }
            }
        }
        self.last_measured_jitter = stddev;
        self.last_measured_delay = stddev_delay as u32;

        if self.dont_change_delay == 0 {
            if self.avg_delay > self.min_delay + 0.5 {
                self.outstanding_delay_change -= if self.avg_delay > self.min_delay + 2.0 { 60 } else { 20 };
                self.dont_change_delay += 10;
            } else if self.avg_delay < self.min_delay - 0.3 {
                self.outstanding_delay_change += 20;
                self.dont_change_delay += 10;
            }
        }
        if self.dont_change_delay > 0 {
            self.dont_change_delay -= 1;
        }
    }
}

/// Playback stretch hint returned by [`JitterBuffer::handle_output`]: the
/// decoder scales its frame duration toward this to absorb small delay
/// corrections without audible glitches.
pub const PLAYBACK_SHORTEN_MS: u32 = 40;
pub const PLAYBACK_NOMINAL_MS: u32 = 60;
pub const PLAYBACK_LENGTHEN_MS: u32 = 80;

/// A 64-slot jitter buffer for one incoming audio stream.
pub struct JitterBuffer {
    inner: Mutex<Inner>,
}

impl JitterBuffer {
    pub fn new(step_ms: u32) -> Self {
        let tuneables = tuneables_for_step(step_ms);
        let mut inner = Inner {
            slots: (0..SLOT_COUNT).map(|_| None).collect(),
            next_timestamp: 0,
            step: step_ms,
            tuneables,
            min_delay: 6.0,
            last_put_timestamp: 0,
            lost_count: 0,
            lost_since_reset: 0,
            got_since_reset: 0,
            was_reset: true,
            needs_buffering: true,
            delay_history: [0; HISTORY_LEN],
            late_history: [0; HISTORY_LEN],
            late_packet_count: 0,
            dont_inc_min_delay: 0,
            dont_dec_min_delay: 0,
            lost_packets: 0,
            prev_recv_time: 0.0,
            expect_next_at_time: 0.0,
            deviation_history: [0.0; HISTORY_LEN],
            deviation_ptr: 0,
            last_measured_jitter: 0.0,
            last_measured_delay: 0,
            outstanding_delay_change: 0,
            dont_change_delay: 0,
            avg_delay: 0.0,
            epoch: Instant::now(),
        };
        inner.reset();
        Self { inner: Mutex::new(inner) }
    }

    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    pub fn put(&self, data: &[u8], timestamp: u32, is_ec: bool) {
        self.inner.lock().put(data, timestamp, is_ec);
    }

    pub fn get(&self, offset_in_steps: i32, advance: bool) -> GetOutcome {
        self.inner.lock().get(offset_in_steps, advance)
    }

    pub fn tick(&self) {
        self.inner.lock().tick();
    }

    /// `Get` plus the playback-duration hint: shorten (40ms)/lengthen
    /// (80ms) while an `outstandingDelayChange` is being worked off,
    /// nominal (60ms) otherwise. The change budget decays by 20 per call.
    pub fn handle_output(&self, offset_in_steps: i32) -> (GetOutcome, u32) {
        let mut inner = self.inner.lock();
        let result = inner.get(offset_in_steps, true);
        let duration = if inner.outstanding_delay_change != 0 {
            if inner.outstanding_delay_change < 0 {
                inner.outstanding_delay_change += 20;
                PLAYBACK_SHORTEN_MS
            } else {
                inner.outstanding_delay_change -= 20;
                PLAYBACK_LENGTHEN_MS
            }
        } else {
            PLAYBACK_NOMINAL_MS
        };
        (result, duration)
    }

    pub fn min_packet_count(&self) -> f64 {
        self.inner.lock().min_delay
    }

    pub fn current_delay(&self) -> u32 {
        self.inner.lock().current_delay()
    }

    pub fn average_delay(&self) -> f64 {
        self.inner.lock().avg_delay
    }

    pub fn last_measured_jitter(&self) -> f64 {
        self.inner.lock().last_measured_jitter
    }

    pub fn last_measured_delay(&self) -> u32 {
        self.inner.lock().last_measured_delay
    }

    pub fn get_and_reset_lost_packet_count(&self) -> i32 {
        let mut inner = self.inner.lock();
        let r = inner.lost_packets;
        inner.lost_packets = 0;
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_put_resyncs_next_timestamp_from_min_delay() {
        let jb = JitterBuffer::new(20);
        jb.put(b"frame0", 1000, false);
        // next_timestamp should trail the first put by min_delay steps.
        assert_eq!(jb.get(0, false), GetOutcome::Buffering);
    }

    #[test]
    fn put_then_get_returns_payload_in_order() {
        let jb = JitterBuffer::new(20);
        jb.put(b"frame0", 1000, false);
        let target_offset = {
            // the buffer resyncs nextTimestamp = 1000 - 20*6 = 880
            (1000 - 880) / 20
        };
        match jb.get(target_offset, true) {
            GetOutcome::Ok { data, .. } => assert_eq!(data, b"frame0"),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn missing_packet_is_reported_without_buffering_flag_once_started() {
        let jb = JitterBuffer::new(20);
        jb.put(b"frame0", 1000, false);
        jb.get(0, true); // clears needs_buffering via Ok or Buffering path
        for _ in 0..3 {
            jb.get(0, true);
        }
        // after repeated gets past the one real packet we should see either
        // Missing or a forced reset back to Buffering, never a panic.
        let outcome = jb.get(0, true);
        assert!(matches!(outcome, GetOutcome::Missing | GetOutcome::Buffering));
    }

    #[test]
    fn tick_does_not_panic_on_empty_buffer() {
        let jb = JitterBuffer::new(40);
        for _ in 0..32 {
            jb.tick();
        }
    }

    #[test]
    fn handle_output_defaults_to_nominal_duration() {
        let jb = JitterBuffer::new(60);
        let (_, duration) = jb.handle_output(0);
        assert_eq!(duration, PLAYBACK_NOMINAL_MS);
    }
}
