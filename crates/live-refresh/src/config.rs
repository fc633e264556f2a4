//! Configuration types for the refresh poller.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Fixed tick period.
    pub poll_interval_ms: u64,
    /// Web version is checked every Nth tick.
    pub version_check_every: u64,
    /// Router refresh piggybacks on a data refresh every Mth tick.
    pub router_refresh_every: u64,
    /// Routes that never receive a router refresh.
    pub exempt_routes: Vec<String>,
    /// Where the pause/resume flag is persisted, when anywhere.
    pub state_path: Option<PathBuf>,
}

impl PollerConfig {
    pub fn defaults() -> Self {
        Self {
            poll_interval_ms: 10_000,
            version_check_every: 6,
            router_refresh_every: 8,
            exempt_routes: Vec::new(),
            state_path: None,
        }
    }

    /// Floors keep a bad env value from creating a busy poll loop or a
    /// modulo-by-zero cadence.
    pub fn clamped(mut self) -> Self {
        self.poll_interval_ms = self.poll_interval_ms.max(1000);
        self.version_check_every = self.version_check_every.max(1);
        self.router_refresh_every = self.router_refresh_every.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamping_enforces_floors() {
        let config = PollerConfig {
            poll_interval_ms: 5,
            version_check_every: 0,
            router_refresh_every: 0,
            ..PollerConfig::defaults()
        }
        .clamped();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.version_check_every, 1);
        assert_eq!(config.router_refresh_every, 1);
    }
}
