//! ## Congestion controller
//!
//! Tracks round-trip time and in-flight data to decide whether the audio
//! encoder should raise or lower its target bitrate. Grounded directly on
//! `CongestionControl`: a 100-slot ring of inflight packets evicted by
//! oldest-send-time, a 100-sample RTT history, and a 30-sample inflight
//! occupancy history sampled at 10 Hz.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

const RTT_HISTORY_LEN: usize = 100;
const INFLIGHT_SLOTS: usize = 100;
const INFLIGHT_HISTORY_LEN: usize = 30;
const RTT_AVERAGE_WINDOW: usize = 30;
const INFLIGHT_TIMEOUT: Duration = Duration::from_secs(2);
const ACTION_COOLDOWN: Duration = Duration::from_secs(1);

/// The result of [`CongestionController::bandwidth_control_action`]: the
/// encoder should raise, lower, or leave its target bitrate alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthAction {
    Increase,
    Decrease,
    None,
}

#[derive(Clone, Copy)]
struct InflightSlot {
    seq: u32,
    size: usize,
    send_time: Option<Instant>,
}

impl Default for InflightSlot {
    fn default() -> Self {
        Self { seq: 0, size: 0, send_time: None }
    }
}

struct Inner {
    rtt_history: [f64; RTT_HISTORY_LEN],
    rtt_history_size: usize,
    rtt_history_top: usize,
    tmp_rtt: f64,
    tmp_rtt_count: u32,

    last_sent_seq: u32,
    inflight_packets: [InflightSlot; INFLIGHT_SLOTS],
    inflight_data_size: usize,

    inflight_history: [usize; INFLIGHT_HISTORY_LEN],
    inflight_history_top: usize,

    cwnd: usize,
    loss_count: u32,
    acked_count: u32,
    last_action_time: Option<Instant>,
}

/// `seqgt(a, b)`: true if `a` is strictly ahead of `b` on a wrapping 32-bit
/// sequence space.
fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Bandwidth estimator. One instance per call; `packet_sent`/
/// `packet_acknowledged` are called from the send/receive paths, `tick`
/// from the 10 Hz timer.
pub struct CongestionController {
    inner: Mutex<Inner>,
}

impl CongestionController {
    pub fn new(initial_cwnd: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                rtt_history: [0.0; RTT_HISTORY_LEN],
                rtt_history_size: 0,
                rtt_history_top: 0,
                tmp_rtt: 0.0,
                tmp_rtt_count: 0,
                last_sent_seq: 0,
                inflight_packets: [InflightSlot::default(); INFLIGHT_SLOTS],
                inflight_data_size: 0,
                inflight_history: [0; INFLIGHT_HISTORY_LEN],
                inflight_history_top: 0,
                cwnd: initial_cwnd,
                loss_count: 0,
                acked_count: 0,
                last_action_time: None,
            }),
        }
    }

    /// Records an outgoing packet. Ignored (with a log) if `seq` isn't
    /// strictly ahead of the last sent sequence - a duplicate resend.
    /// Evicts the slot with the oldest send time, counting the eviction of
    /// a still-unacknowledged slot as a loss.
    pub fn packet_sent(&self, seq: u32, size: usize) {
        let mut inner = self.inner.lock();
        if !seq_gt(seq, inner.last_sent_seq) {
            log::warn!("duplicate outgoing seq {seq}");
            return;
        }
        inner.last_sent_seq = seq;

        let now = Instant::now();
        let mut slot_index = 0;
        let mut oldest = Instant::now();
        let mut found_free = false;
        for (i, slot) in inner.inflight_packets.iter().enumerate() {
            match slot.send_time {
                None => {
                    slot_index = i;
                    found_free = true;
                    break;
                }
                Some(t) if t < oldest => {
                    oldest = t;
                    slot_index = i;
                }
                _ => {}
            }
        }
        let _ = found_free;

        let slot = &mut inner.inflight_packets[slot_index];
        if slot.send_time.is_some() {
            inner.inflight_data_size -= slot.size;
            inner.loss_count += 1;
            log::debug!("packet with seq {} was not acknowledged", slot.seq);
        }
        slot.seq = seq;
        slot.size = size;
        slot.send_time = Some(now);
        inner.inflight_data_size += size;
    }

    /// Records an acknowledgement: finds the matching inflight slot (by
    /// `seq`, ignoring already-freed slots), accumulates its RTT sample,
    /// and frees it.
    pub fn packet_acknowledged(&self, seq: u32) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        for slot in inner.inflight_packets.iter_mut() {
            if slot.seq == seq {
                if let Some(sent) = slot.send_time {
                    inner.tmp_rtt += now.duration_since(sent).as_secs_f64();
                    inner.tmp_rtt_count += 1;
                    inner.acked_count += 1;
                    slot.send_time = None;
                    inner.inflight_data_size -= slot.size;
                    break;
                }
            }
        }
    }

    /// Called at 10 Hz: folds the pending RTT samples into the history,
    /// times out inflight slots older than 2 seconds as losses, and
    /// samples the current inflight size into the occupancy history.
    pub fn tick(&self) {
        let mut inner = self.inner.lock();

        if inner.tmp_rtt_count > 0 {
            let sample = inner.tmp_rtt / inner.tmp_rtt_count as f64;
            let top = inner.rtt_history_top;
            inner.rtt_history[top] = sample;
            inner.rtt_history_top = (top + 1) % RTT_HISTORY_LEN;
            if inner.rtt_history_size < RTT_HISTORY_LEN {
                inner.rtt_history_size += 1;
            }
            inner.tmp_rtt = 0.0;
            inner.tmp_rtt_count = 0;
        }

        let now = Instant::now();
        for slot in inner.inflight_packets.iter_mut() {
            if let Some(sent) = slot.send_time {
                if now.duration_since(sent) > INFLIGHT_TIMEOUT {
                    slot.send_time = None;
                    inner.inflight_data_size -= slot.size;
                    inner.loss_count += 1;
                    log::debug!("packet with seq {} was not acknowledged", slot.seq);
                }
            }
        }

        let data_size = inner.inflight_data_size;
        let top = inner.inflight_history_top;
        inner.inflight_history[top] = data_size;
        inner.inflight_history_top = (top + 1) % INFLIGHT_HISTORY_LEN;
    }

    /// Mean RTT over the last 30 samples (or fewer if the call is young).
    pub fn average_rtt(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.rtt_history_size == 0 {
            return 0.0;
        }
        let count = RTT_AVERAGE_WINDOW.min(inner.rtt_history_size);
        let mut sum = 0.0;
        for i in 0..count {
            let idx = (inner.rtt_history_top as i64 - i as i64 - 1).rem_euclid(RTT_HISTORY_LEN as i64) as usize;
            sum += inner.rtt_history[idx];
        }
        sum / count as f64
    }

    /// Minimum nonzero RTT ever recorded in the ring.
    pub fn minimum_rtt(&self) -> f64 {
        let inner = self.inner.lock();
        inner
            .rtt_history
            .iter()
            .copied()
            .filter(|&v| v > 0.0)
            .fold(f64::INFINITY, f64::min)
    }

    /// Mean of the 30-sample inflight occupancy history.
    pub fn inflight_data_size(&self) -> usize {
        let inner = self.inner.lock();
        let sum: usize = inner.inflight_history.iter().sum();
        sum / INFLIGHT_HISTORY_LEN
    }

    pub fn congestion_window(&self) -> usize {
        self.inner.lock().cwnd
    }

    pub fn send_loss_count(&self) -> u32 {
        self.inner.lock().loss_count
    }

    /// Fraction of resolved outgoing packets (acknowledged or timed out)
    /// that were lost, over the controller's whole lifetime. Feeds shitty
    /// internet mode's loss threshold; a cumulative count rather than a
    /// rolling window, so it responds slower than a true 5-second average
    /// once a call has been running a while.
    pub fn send_loss_ratio(&self) -> f64 {
        let inner = self.inner.lock();
        let total = inner.loss_count + inner.acked_count;
        if total == 0 {
            0.0
        } else {
            inner.loss_count as f64 / total as f64
        }
    }

    /// At most once per second: `Increase` if the 30-sample inflight
    /// average sits below 90% of `cwnd`, `Decrease` if above 110%, else
    /// `None`.
    pub fn bandwidth_control_action(&self) -> BandwidthAction {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(last) = inner.last_action_time {
            if now.duration_since(last) < ACTION_COOLDOWN {
                return BandwidthAction::None;
            }
        }

        let inflight_avg: usize = {
            let sum: usize = inner.inflight_history.iter().sum();
            sum / INFLIGHT_HISTORY_LEN
        };
        let cwnd = inner.cwnd;
        let min = cwnd - cwnd / 10;
        let max = cwnd + cwnd / 10;

        if inflight_avg < min {
            inner.last_action_time = Some(now);
            BandwidthAction::Increase
        } else if inflight_avg > max {
            inner.last_action_time = Some(now);
            BandwidthAction::Decrease
        } else {
            BandwidthAction::None
        }
    }
}
