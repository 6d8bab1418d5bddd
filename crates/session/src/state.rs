//! Session state machine (§4.9, §6).

use std::time::{Duration, Instant};

pub const DEFAULT_RECONNECTING_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_ESTABLISHED_DELAY_IF_NO_STREAM_DATA: Duration = Duration::from_millis(1500);

/// Mirrors the public `State` enum of the control surface (§6). `Reconnecting`
/// is a side-state entered from `Established` and left again on recovery, not
/// a dead end. `Stopped` and `Failed` are both terminal (no `StateMachine`
/// leaves either one), but only `Failed` carries an error: `Stopped` is what
/// a clean `Stop()` lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    WaitInit,
    WaitInitAck,
    Established,
    Reconnecting,
    Stopped,
    Failed,
}

/// `GetLastError` result (§6/§7). `Unknown` is the non-error default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Error {
    #[default]
    Unknown,
    Incompatible,
    Timeout,
    AudioIo,
    Proxy,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Unknown => write!(f, "unknown error"),
            Error::Incompatible => write!(f, "incompatible peer protocol version"),
            Error::Timeout => write!(f, "timed out"),
            Error::AudioIo => write!(f, "audio I/O initialization failed"),
            Error::Proxy => write!(f, "proxy connection failed"),
        }
    }
}

impl std::error::Error for Error {}

/// Drives the `WaitInit → WaitInitAck → Established` progression plus the
/// `Reconnecting` side-state, tracking the deadlines each state depends on.
pub struct StateMachine {
    state: SessionState,
    last_error: Error,
    reconnecting_timeout: Duration,
    established_delay_if_no_stream_data: Duration,
    last_valid_packet_at: Option<Instant>,
    established_deadline: Option<Instant>,
    pre_reconnect_state: Option<SessionState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::WaitInit,
            last_error: Error::Unknown,
            reconnecting_timeout: DEFAULT_RECONNECTING_TIMEOUT,
            established_delay_if_no_stream_data: DEFAULT_ESTABLISHED_DELAY_IF_NO_STREAM_DATA,
            last_valid_packet_at: None,
            established_deadline: None,
            pre_reconnect_state: None,
        }
    }

    pub fn with_timeouts(reconnecting_timeout: Duration, established_delay_if_no_stream_data: Duration) -> Self {
        Self { reconnecting_timeout, established_delay_if_no_stream_data, ..Self::new() }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_error(&self) -> Error {
        self.last_error
    }

    /// `InitAck` arrived: move to `WaitInitAck` → schedule the deferred
    /// `Established` transition unless stream data beats it there.
    pub fn init_ack_received(&mut self, now: Instant) {
        if self.state == SessionState::WaitInit || self.state == SessionState::WaitInitAck {
            self.state = SessionState::WaitInitAck;
            self.established_deadline = Some(now + self.established_delay_if_no_stream_data);
        }
    }

    /// First stream-data packet short-circuits the deferred transition.
    pub fn stream_data_received(&mut self, now: Instant) {
        self.last_valid_packet_at = Some(now);
        if self.state == SessionState::WaitInitAck {
            self.state = SessionState::Established;
            self.established_deadline = None;
        } else if self.state == SessionState::Reconnecting {
            self.leave_reconnecting();
        }
    }

    /// Any valid (decrypted, in-order-enough) packet resets the
    /// reconnecting-timeout clock and, if we were reconnecting, recovers.
    pub fn valid_packet_received(&mut self, now: Instant) {
        self.last_valid_packet_at = Some(now);
        if self.state == SessionState::Reconnecting {
            self.leave_reconnecting();
        }
    }

    fn leave_reconnecting(&mut self) {
        self.state = self.pre_reconnect_state.take().unwrap_or(SessionState::Established);
    }

    /// Called on the 10 Hz tick; applies the deferred-Established timeout and
    /// the reconnecting-timeout watchdog. Returns `true` if the state changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        let before = self.state;

        if self.state == SessionState::WaitInitAck {
            if let Some(deadline) = self.established_deadline {
                if now >= deadline {
                    self.state = SessionState::Established;
                    self.established_deadline = None;
                }
            }
        }

        if matches!(self.state, SessionState::Established | SessionState::WaitInitAck) {
            if let Some(last) = self.last_valid_packet_at {
                if now.duration_since(last) >= self.reconnecting_timeout {
                    self.pre_reconnect_state = Some(self.state);
                    self.state = SessionState::Reconnecting;
                }
            }
        }

        before != self.state
    }

    /// Moves to the terminal `Failed` state with the given cause. Once
    /// failed, only a fresh `StateMachine` (a new `Connect`) recovers.
    pub fn fail(&mut self, cause: Error) {
        self.state = SessionState::Failed;
        self.last_error = cause;
    }

    /// Moves to the terminal `Stopped` state. Unlike `fail`, this leaves
    /// `last_error` untouched: a clean shutdown is not an error.
    pub fn stop(&mut self) {
        self.state = SessionState::Stopped;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_data_short_circuits_the_established_delay() {
        let mut sm = StateMachine::new();
        let now = Instant::now();
        sm.init_ack_received(now);
        assert_eq!(sm.state(), SessionState::WaitInitAck);
        sm.stream_data_received(now + Duration::from_millis(10));
        assert_eq!(sm.state(), SessionState::Established);
    }

    #[test]
    fn established_delay_elapses_without_stream_data() {
        let mut sm = StateMachine::new();
        let now = Instant::now();
        sm.init_ack_received(now);
        assert!(!sm.tick(now + Duration::from_millis(100)));
        assert!(sm.tick(now + DEFAULT_ESTABLISHED_DELAY_IF_NO_STREAM_DATA));
        assert_eq!(sm.state(), SessionState::Established);
    }

    #[test]
    fn silence_past_reconnecting_timeout_enters_reconnecting() {
        let mut sm = StateMachine::new();
        let now = Instant::now();
        sm.init_ack_received(now);
        sm.stream_data_received(now);
        assert_eq!(sm.state(), SessionState::Established);
        assert!(sm.tick(now + DEFAULT_RECONNECTING_TIMEOUT));
        assert_eq!(sm.state(), SessionState::Reconnecting);
    }

    #[test]
    fn valid_packet_recovers_from_reconnecting() {
        let mut sm = StateMachine::new();
        let now = Instant::now();
        sm.init_ack_received(now);
        sm.stream_data_received(now);
        sm.tick(now + DEFAULT_RECONNECTING_TIMEOUT);
        assert_eq!(sm.state(), SessionState::Reconnecting);
        sm.valid_packet_received(now + DEFAULT_RECONNECTING_TIMEOUT + Duration::from_millis(1));
        assert_eq!(sm.state(), SessionState::Established);
    }

    #[test]
    fn fail_is_terminal() {
        let mut sm = StateMachine::new();
        sm.fail(Error::Incompatible);
        assert_eq!(sm.state(), SessionState::Failed);
        assert_eq!(sm.last_error(), Error::Incompatible);
    }

    #[test]
    fn stop_is_terminal_and_not_an_error() {
        let mut sm = StateMachine::new();
        sm.init_ack_received(Instant::now());
        sm.stop();
        assert_eq!(sm.state(), SessionState::Stopped);
        assert_eq!(sm.last_error(), Error::Unknown);
        assert!(!sm.tick(Instant::now() + Duration::from_secs(10)));
        assert_eq!(sm.state(), SessionState::Stopped);
    }
}
