//! Shitty-Internet mode (§4.9): a secondary, lower-bitrate Opus-with-FEC
//! encoder kicks in when send loss crosses a threshold, and its output
//! rides along as `PKT_STREAM_EC` payloads. The enable/disable thresholds
//! are deliberately asymmetric (hysteresis) so a loss rate hovering near
//! the boundary doesn't flap the secondary encoder on and off every tick.

/// Resolved from the open question in the distilled spec: enable at
/// `>= 0.125` average send loss, disable only once it drops `< 0.15`.
pub const ENABLE_THRESHOLD: f64 = 0.125;
pub const DISABLE_THRESHOLD: f64 = 0.15;

#[derive(Debug, Default)]
pub struct ShittyInternetMode {
    enabled: bool,
}

impl ShittyInternetMode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Feeds the current 5-second average send-loss ratio; returns `true`
    /// if this call changed the mode.
    pub fn update(&mut self, average_loss: f64) -> bool {
        let was_enabled = self.enabled;
        if !self.enabled && average_loss >= ENABLE_THRESHOLD {
            self.enabled = true;
        } else if self.enabled && average_loss < DISABLE_THRESHOLD {
            self.enabled = false;
        }
        was_enabled != self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enables_at_threshold() {
        let mut mode = ShittyInternetMode::new();
        assert!(mode.update(0.13));
        assert!(mode.is_enabled());
    }

    #[test]
    fn does_not_enable_below_threshold() {
        let mut mode = ShittyInternetMode::new();
        assert!(!mode.update(0.1));
        assert!(!mode.is_enabled());
    }

    #[test]
    fn stays_enabled_above_disable_threshold() {
        let mut mode = ShittyInternetMode::new();
        mode.update(0.2);
        assert!(!mode.update(0.16));
        assert!(mode.is_enabled());
    }

    #[test]
    fn disables_once_loss_drops_below_disable_threshold() {
        let mut mode = ShittyInternetMode::new();
        mode.update(0.2);
        assert!(mode.update(0.1));
        assert!(!mode.is_enabled());
    }
}
