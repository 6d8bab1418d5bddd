//! The default `SessionObserver`: logs every callback at `info`, mirroring
//! `turn_server::observer::Observer`'s log-then-forward style (there it
//! forwards to a webhook `Hooks` sink too; this engine has no such sink, so
//! logging is the whole implementation).

use session::state::SessionState;
use session::SessionObserver;

pub struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn connection_state_changed(&self, state: SessionState) {
        log::info!("connection state changed: {state:?}");
    }

    fn signal_bar_count_changed(&self, bars: u8) {
        log::debug!("signal bars: {bars}");
    }

    fn group_call_key_received(&self, key: &[u8]) {
        log::info!("group call key received ({} bytes)", key.len());
    }

    fn group_call_key_sent(&self) {
        log::info!("group call key sent");
    }

    fn upgrade_to_group_call_requested(&self) {
        log::info!("peer requested group call upgrade");
    }
}
