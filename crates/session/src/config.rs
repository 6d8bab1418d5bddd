//! Session-scoped configuration (§6): the knobs the state machine, pacing
//! loop, and endpoint selector read at runtime. Distinct from the
//! process-wide `Config` in the `voip-core` binary (§11), which layers CLI
//! flags and a config file on top of this crate's defaults before handing
//! a `SessionConfig` to `Session::new`.

use std::collections::HashMap;
use std::time::Duration;

/// `dataSaving` control (§6): governs whether the secondary Shitty-Internet
/// encoder and non-essential extras are allowed to run at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSaving {
    Never,
    MobileOnly,
    Always,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub init_timeout: Duration,
    pub recv_timeout: Duration,
    pub data_saving: DataSaving,
    pub enable_aec: bool,
    pub enable_ns: bool,
    pub enable_agc: bool,
    pub allow_p2p: bool,
    pub connection_max_layer: u32,
    pub reconnecting_state_timeout: Duration,
    pub established_delay_if_no_stream_data: Duration,
    pub relay_switch_threshold: f64,
    pub relay_to_p2p_switch_threshold: f64,
    pub p2p_to_relay_switch_threshold: f64,
    pub force_tcp: bool,
    pub use_tcp: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(20),
            recv_timeout: Duration::from_secs(20),
            data_saving: DataSaving::Never,
            enable_aec: true,
            enable_ns: true,
            enable_agc: true,
            allow_p2p: true,
            connection_max_layer: 74,
            reconnecting_state_timeout: crate::state::DEFAULT_RECONNECTING_TIMEOUT,
            established_delay_if_no_stream_data: crate::state::DEFAULT_ESTABLISHED_DELAY_IF_NO_STREAM_DATA,
            relay_switch_threshold: crate::endpoint_select::RELAY_SWITCH_THRESHOLD,
            relay_to_p2p_switch_threshold: crate::endpoint_select::RELAY_TO_P2P_SWITCH_THRESHOLD,
            p2p_to_relay_switch_threshold: crate::endpoint_select::P2P_TO_RELAY_SWITCH_THRESHOLD,
            force_tcp: false,
            use_tcp: false,
        }
    }
}

impl SessionConfig {
    /// `peer version >= 6` selects MTProto-2 by default per §6.
    pub fn uses_mtproto2(&self) -> bool {
        self.connection_max_layer >= 74
    }

    /// Applies the server-pushed string dictionary (§6) on top of the
    /// current values. Unknown or unparseable keys are ignored, matching
    /// the original's tolerant server-config parsing; only recognized
    /// numeric/duration keys are applied.
    pub fn apply_server_dictionary(&mut self, dict: &HashMap<String, String>) {
        if let Some(v) = parse_f64(dict, "relay_switch_threshold") {
            self.relay_switch_threshold = v;
        }
        if let Some(v) = parse_f64(dict, "relay_to_p2p_switch_threshold") {
            self.relay_to_p2p_switch_threshold = v;
        }
        if let Some(v) = parse_f64(dict, "p2p_to_relay_switch_threshold") {
            self.p2p_to_relay_switch_threshold = v;
        }
        if let Some(v) = parse_secs(dict, "reconnecting_state_timeout") {
            self.reconnecting_state_timeout = v;
        }
        if let Some(v) = parse_secs(dict, "established_delay_if_no_stream_data") {
            self.established_delay_if_no_stream_data = v;
        }
        if let Some(v) = dict.get("force_tcp").and_then(|s| s.parse().ok()) {
            self.force_tcp = v;
        }
        if let Some(v) = dict.get("use_tcp").and_then(|s| s.parse().ok()) {
            self.use_tcp = v;
        }
    }
}

fn parse_f64(dict: &HashMap<String, String>, key: &str) -> Option<f64> {
    dict.get(key).and_then(|s| s.parse().ok())
}

fn parse_secs(dict: &HashMap<String, String>, key: &str) -> Option<Duration> {
    dict.get(key).and_then(|s| s.parse::<f64>().ok()).map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_selects_mtproto2() {
        assert!(SessionConfig::default().uses_mtproto2());
    }

    #[test]
    fn server_dictionary_overrides_thresholds() {
        let mut cfg = SessionConfig::default();
        let mut dict = HashMap::new();
        dict.insert("relay_switch_threshold".to_string(), "0.7".to_string());
        dict.insert("force_tcp".to_string(), "true".to_string());
        cfg.apply_server_dictionary(&dict);
        assert_eq!(cfg.relay_switch_threshold, 0.7);
        assert!(cfg.force_tcp);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut cfg = SessionConfig::default();
        let before = cfg.relay_switch_threshold;
        let mut dict = HashMap::new();
        dict.insert("nonsense_key".to_string(), "1".to_string());
        cfg.apply_server_dictionary(&dict);
        assert_eq!(cfg.relay_switch_threshold, before);
    }
}
