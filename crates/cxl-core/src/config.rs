//! Runtime timing configuration for decoder programming.

use std::time::Duration;

/// Time hardware is given to acknowledge a decoder commit.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_millis(10);
/// Delay granted to firmware-programmed decoders before enumeration reads them.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(20);
/// Interval between control-register polls while a commit is pending.
pub const DEFAULT_COMMIT_POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Timing knobs shared by every decoder in a [`crate::Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize, serde::Serialize),
    serde(default)
)]
pub struct CxlConfig {
    /// Upper bound on the commit acknowledgement wait.
    pub commit_timeout: Duration,
    /// Wait applied once per enumeration when some slots are not yet committed.
    pub settle_delay: Duration,
    /// Sleep between commit status polls.
    pub commit_poll_interval: Duration,
}

impl CxlConfig {
    /// Returns a configuration with no settle delay and a tight poll loop.
    ///
    /// Intended for simulated register blocks that respond synchronously.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            settle_delay: Duration::ZERO,
            commit_poll_interval: Duration::from_micros(1),
        }
    }
}

impl Default for CxlConfig {
    fn default() -> Self {
        Self {
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            commit_poll_interval: DEFAULT_COMMIT_POLL_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CxlConfig, DEFAULT_COMMIT_TIMEOUT};
    use std::time::Duration;

    #[test]
    fn defaults_match_hardware_timing() {
        let config = CxlConfig::default();
        assert_eq!(config.commit_timeout, Duration::from_millis(10));
        assert_eq!(config.settle_delay, Duration::from_millis(20));
        assert_eq!(config.commit_poll_interval, Duration::from_micros(50));
    }

    #[test]
    fn immediate_profile_keeps_commit_timeout() {
        let config = CxlConfig::immediate();
        assert_eq!(config.commit_timeout, DEFAULT_COMMIT_TIMEOUT);
        assert_eq!(config.settle_delay, Duration::ZERO);
    }
}
