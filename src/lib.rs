//! PagePulse: telemetry and self-healing refresh relay for a
//! server-backed single-page application.
//!
//! Three components cooperate behind one HTTP surface:
//! - the view lifecycle tracker aggregates per-view API activity into a
//!   single runtime beacon,
//! - the circuit-breaker health proxy shields the backend health
//!   endpoint during outages,
//! - the live-refresh poller detects data and bundle changes and fans
//!   out refresh signals.

pub mod config;
pub mod errors;
pub mod metrics;
pub mod server;

use std::sync::Arc;

use tokio::time::Duration;

use pagepulse_beacon::{
    BeaconSink, QueueWorker, QueuedBeaconSink, DEFAULT_DELIVERY_TIMEOUT, DEFAULT_QUEUE_CAPACITY,
};
use pagepulse_health_breaker::{HealthProxy, HttpHealthProbe};
use pagepulse_live_refresh::{HttpChangeProbe, RefreshPoller};

pub use config::AppConfig;
pub use errors::{RelayError, Result};
pub use server::{build_router, BeaconForwarder, ServeState};

/// Build timestamp, doubling as the web bundle version identifier.
pub const BUILD_DATE: &str = env!("BUILD_DATE");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Everything `serve` needs: route state plus the handles that must be
/// shut down in order on exit.
pub struct Relay {
    pub state: ServeState,
    pub poller: Arc<RefreshPoller>,
    pub sink: Arc<QueuedBeaconSink>,
    pub worker: QueueWorker,
}

/// Wire the three components together against one backend.
pub fn build_relay(config: &AppConfig) -> Relay {
    let client = reqwest::Client::new();
    let probe_timeout = Duration::from_millis(config.breaker_config().probe_timeout_ms);

    let (sink, worker) = QueuedBeaconSink::spawn(
        client.clone(),
        config.events_url(),
        DEFAULT_QUEUE_CAPACITY,
        DEFAULT_DELIVERY_TIMEOUT,
    );

    let proxy = Arc::new(HealthProxy::new(
        config.breaker_config(),
        Arc::new(HttpHealthProbe::new(
            client.clone(),
            config.health_url(),
            probe_timeout,
        )),
        Arc::clone(&sink) as Arc<dyn BeaconSink>,
        config.api_url.clone(),
        BUILD_DATE.to_string(),
    ));

    let poller = RefreshPoller::new(
        config.poller_config(),
        Arc::new(HttpChangeProbe::new(
            client.clone(),
            config.change_token_url(),
            config.web_version_url(),
            probe_timeout,
        )),
    );

    let forwarder = Arc::new(BeaconForwarder::new(
        client,
        config.events_url(),
        probe_timeout,
    ));

    let state = ServeState::new(Arc::clone(&proxy), Arc::clone(&poller), forwarder);
    Relay {
        state,
        poller,
        sink,
        worker,
    }
}
