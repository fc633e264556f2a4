//! Configuration types for the view tracker.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Probability that a navigation opens a session, in `[0, 1]`.
    pub sample_rate: f64,
    /// Quiet period with no in-flight tracked calls before a session
    /// finalizes with reason `idle`.
    pub idle_settle_ms: u64,
    /// Hard ceiling on session lifetime regardless of in-flight state.
    pub max_wait_ms: u64,
    /// Calls are trackable only when their path starts with this prefix.
    pub api_prefix: String,
    /// The beacon-delivery endpoint itself is never tracked.
    pub beacon_path: String,
    /// Host of the page issuing the calls, when pinned.
    pub page_host: Option<String>,
    /// Host of the backend API, when pinned.
    pub backend_host: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 0.2,
            idle_settle_ms: 700,
            max_wait_ms: 20_000,
            api_prefix: "/api".to_string(),
            beacon_path: "/runtime-beacon".to_string(),
            page_host: None,
            backend_host: None,
        }
    }
}

impl TrackerConfig {
    /// Clamp numeric knobs to sane floors so a bad env value cannot
    /// produce a zero-length settle window or an unbounded session.
    pub fn clamped(mut self) -> Self {
        self.sample_rate = self.sample_rate.clamp(0.0, 1.0);
        self.idle_settle_ms = self.idle_settle_ms.max(100);
        self.max_wait_ms = self.max_wait_ms.max(1000);
        self
    }
}
