//! Helper tunables

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime settings for [`UsbHelper`](crate::UsbHelper)
///
/// Every field has a default, so an empty `[usb]` table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperSettings {
    /// Timeout for each control transfer of a feature-report exchange
    pub control_timeout_ms: u64,
    /// Maximum number of undelivered reports held between ticks; the
    /// oldest is dropped to make room for a new one
    pub deferred_queue_limit: usize,
    /// Ticks between two drains of a report-access read loop
    pub hid_poll_interval_ticks: u32,
}

impl HelperSettings {
    /// Devices expect the 500 ms control timeout; change with care
    pub const DEFAULT_CONTROL_TIMEOUT_MS: u64 = 500;
    pub const DEFAULT_DEFERRED_QUEUE_LIMIT: usize = 4096;

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    /// Poll interval clamped to at least one tick
    pub fn hid_poll_interval(&self) -> u32 {
        self.hid_poll_interval_ticks.max(1)
    }
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            control_timeout_ms: Self::DEFAULT_CONTROL_TIMEOUT_MS,
            deferred_queue_limit: Self::DEFAULT_DEFERRED_QUEUE_LIMIT,
            hid_poll_interval_ticks: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = HelperSettings::default();
        assert_eq!(settings.control_timeout(), Duration::from_millis(500));
        assert_eq!(settings.deferred_queue_limit, 4096);
        assert_eq!(settings.hid_poll_interval(), 1);
    }

    #[test]
    fn test_partial_table_uses_defaults() {
        let settings: HelperSettings = toml::from_str("deferred_queue_limit = 8").unwrap();
        assert_eq!(settings.deferred_queue_limit, 8);
        assert_eq!(settings.control_timeout_ms, 500);
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let settings = HelperSettings {
            hid_poll_interval_ticks: 0,
            ..HelperSettings::default()
        };
        assert_eq!(settings.hid_poll_interval(), 1);
    }
}
