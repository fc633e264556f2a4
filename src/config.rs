//! Environment-driven relay configuration.
//!
//! Every knob has a documented default and a clamped floor so a typo'd
//! env value degrades to something sane instead of a busy loop or a
//! zero-length cooldown.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use pagepulse_health_breaker::BreakerConfig;
use pagepulse_live_refresh::config::PollerConfig;
use pagepulse_live_refresh::persist;
use pagepulse_view_tracker::config::TrackerConfig;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_LISTEN_PORT: u16 = 8080;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Base URL of the backend API the relay fronts.
    pub api_url: String,
    /// Port the relay server listens on.
    pub listen_port: u16,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub health_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub version_check_every: u64,
    pub router_refresh_every: u64,
    pub sample_rate: f64,
    pub idle_settle_ms: u64,
    pub max_wait_ms: u64,
    /// Directory for persisted state; platform data dir when unset.
    pub storage_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            failure_threshold: 2,
            cooldown_ms: 30_000,
            health_timeout_ms: 15_000,
            poll_interval_ms: 10_000,
            version_check_every: 6,
            router_refresh_every: 8,
            sample_rate: 0.2,
            idle_settle_ms: 700,
            max_wait_ms: 20_000,
            storage_path: None,
        }
    }
}

fn env_value<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: env::var("PAGEPULSE_API_URL")
                .ok()
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty())
                .unwrap_or(defaults.api_url),
            listen_port: env_value("PAGEPULSE_LISTEN_PORT", defaults.listen_port),
            failure_threshold: env_value("PAGEPULSE_FAILURE_THRESHOLD", defaults.failure_threshold),
            cooldown_ms: env_value("PAGEPULSE_COOLDOWN_MS", defaults.cooldown_ms),
            health_timeout_ms: env_value("PAGEPULSE_HEALTH_TIMEOUT_MS", defaults.health_timeout_ms),
            poll_interval_ms: env_value("PAGEPULSE_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            version_check_every: env_value(
                "PAGEPULSE_VERSION_CHECK_EVERY",
                defaults.version_check_every,
            ),
            router_refresh_every: env_value(
                "PAGEPULSE_ROUTER_REFRESH_EVERY",
                defaults.router_refresh_every,
            ),
            sample_rate: env_value("PAGEPULSE_SAMPLE_RATE", defaults.sample_rate),
            idle_settle_ms: env_value("PAGEPULSE_IDLE_SETTLE_MS", defaults.idle_settle_ms),
            max_wait_ms: env_value("PAGEPULSE_MAX_WAIT_MS", defaults.max_wait_ms),
            storage_path: env::var("PAGEPULSE_STORAGE_PATH").ok().map(PathBuf::from),
        }
    }

    pub fn health_url(&self) -> String {
        format!("{}/api/health", self.api_url)
    }

    pub fn events_url(&self) -> String {
        format!("{}/api/runtime/events", self.api_url)
    }

    pub fn change_token_url(&self) -> String {
        format!("{}/api/runtime/change-token", self.api_url)
    }

    pub fn web_version_url(&self) -> String {
        format!("http://127.0.0.1:{}/web-version", self.listen_port)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown_window_ms: self.cooldown_ms,
            probe_timeout_ms: self.health_timeout_ms,
        }
        .clamped()
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            poll_interval_ms: self.poll_interval_ms,
            version_check_every: self.version_check_every,
            router_refresh_every: self.router_refresh_every,
            exempt_routes: Vec::new(),
            state_path: Some(persist::default_state_path(self.storage_path.as_deref())),
        }
        .clamped()
    }

    /// Tracker knobs for an embedder wiring the view tracker in front of
    /// its HTTP client:
    ///
    /// ```no_run
    /// use std::sync::Arc;
    ///
    /// use pagepulse::AppConfig;
    /// use pagepulse_beacon::{BeaconSink, DirectBeaconSink, DEFAULT_DELIVERY_TIMEOUT};
    /// use pagepulse_view_tracker::{instrument, ViewTracker};
    ///
    /// let config = AppConfig::from_env();
    /// let client = reqwest::Client::new();
    /// let sink: Arc<dyn BeaconSink> = Arc::new(DirectBeaconSink::new(
    ///     client.clone(),
    ///     config.events_url(),
    ///     DEFAULT_DELIVERY_TIMEOUT,
    /// ));
    /// let tracker = ViewTracker::new(config.tracker_config(), sink);
    /// let http = instrument::install(client, tracker);
    /// ```
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            sample_rate: self.sample_rate,
            idle_settle_ms: self.idle_settle_ms,
            max_wait_ms: self.max_wait_ms,
            ..TrackerConfig::default()
        }
        .clamped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "PAGEPULSE_API_URL",
            "PAGEPULSE_LISTEN_PORT",
            "PAGEPULSE_FAILURE_THRESHOLD",
            "PAGEPULSE_COOLDOWN_MS",
            "PAGEPULSE_HEALTH_TIMEOUT_MS",
            "PAGEPULSE_POLL_INTERVAL_MS",
            "PAGEPULSE_VERSION_CHECK_EVERY",
            "PAGEPULSE_ROUTER_REFRESH_EVERY",
            "PAGEPULSE_SAMPLE_RATE",
            "PAGEPULSE_IDLE_SETTLE_MS",
            "PAGEPULSE_MAX_WAIT_MS",
            "PAGEPULSE_STORAGE_PATH",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_without_env() {
        clear_env();
        let config = AppConfig::from_env();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.cooldown_ms, 30_000);
        assert_eq!(config.poll_interval_ms, 10_000);
        assert!((config.sample_rate - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    #[serial]
    fn env_overrides_and_garbage_falls_back() {
        clear_env();
        env::set_var("PAGEPULSE_API_URL", "https://api.example.com/");
        env::set_var("PAGEPULSE_FAILURE_THRESHOLD", "5");
        env::set_var("PAGEPULSE_COOLDOWN_MS", "not-a-number");
        let config = AppConfig::from_env();
        assert_eq!(config.api_url, "https://api.example.com");
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown_ms, 30_000);
        clear_env();
    }

    #[test]
    #[serial]
    fn derived_urls_join_cleanly() {
        clear_env();
        env::set_var("PAGEPULSE_API_URL", "https://api.example.com");
        let config = AppConfig::from_env();
        assert_eq!(config.health_url(), "https://api.example.com/api/health");
        assert_eq!(
            config.events_url(),
            "https://api.example.com/api/runtime/events"
        );
        assert_eq!(
            config.change_token_url(),
            "https://api.example.com/api/runtime/change-token"
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn component_configs_inherit_clamps() {
        clear_env();
        env::set_var("PAGEPULSE_FAILURE_THRESHOLD", "0");
        env::set_var("PAGEPULSE_POLL_INTERVAL_MS", "5");
        env::set_var("PAGEPULSE_SAMPLE_RATE", "1.5");
        let config = AppConfig::from_env();
        assert_eq!(config.breaker_config().failure_threshold, 1);
        assert_eq!(config.poller_config().poll_interval_ms, 1000);
        assert_eq!(config.tracker_config().sample_rate, 1.0);
        clear_env();
    }
}
