//! Live-refresh polling.
//!
//! A [`RefreshPoller`] ticks on a fixed interval, asks the backend whether
//! tracked data or the client bundle changed, and fans out [`Refresh`]
//! signals on a broadcast bus that page-level data loaders subscribe to.
//! The very first observation of a token or version only seeds the
//! baseline; it never signals change. Ticks are deliberately not mutually
//! excluded: comparisons are idempotent and commutative, so an in-flight
//! tick overlapping the next one is safe.

pub mod config;
pub mod metrics;
pub mod persist;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PollerConfig;

/// Signals fanned out to subscribed data loaders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Refresh {
    /// Tracked data changed; loaders should re-fetch.
    DataChanged { token: String },
    /// Re-run server-side data fetches for the current route.
    RouterRefresh,
    /// The client bundle changed; only a full reload can fix this.
    ReloadRequired { version: String },
}

impl Refresh {
    fn kind(&self) -> &'static str {
        match self {
            Self::DataChanged { .. } => "data_changed",
            Self::RouterRefresh => "router_refresh",
            Self::ReloadRequired { .. } => "reload_required",
        }
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("endpoint returned status {0}")]
    Status(u16),
    #[error("response body unparsable: {0}")]
    Body(String),
}

/// Seam over the change-detection endpoints.
#[async_trait]
pub trait ChangeProbe: Send + Sync {
    async fn change_token(&self) -> Result<String, PollError>;
    async fn web_version(&self) -> Result<String, PollError>;
}

/// Production probe against the backend change-token endpoint and the
/// local relay's web-version endpoint.
pub struct HttpChangeProbe {
    client: reqwest::Client,
    change_token_url: String,
    web_version_url: String,
    timeout: Duration,
}

impl HttpChangeProbe {
    pub fn new(
        client: reqwest::Client,
        change_token_url: String,
        web_version_url: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            change_token_url,
            web_version_url,
            timeout,
        }
    }

    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, PollError> {
        let response = tokio::time::timeout(self.timeout, self.client.get(url).send())
            .await
            .map_err(|_| PollError::Transport("timed out".to_string()))?
            .map_err(|err| PollError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status(status.as_u16()));
        }
        response
            .json()
            .await
            .map_err(|err| PollError::Body(err.to_string()))
    }
}

#[async_trait]
impl ChangeProbe for HttpChangeProbe {
    async fn change_token(&self) -> Result<String, PollError> {
        let body = self.fetch_json(&self.change_token_url).await?;
        body.get("token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| PollError::Body("missing token field".to_string()))
    }

    async fn web_version(&self) -> Result<String, PollError> {
        let body = self.fetch_json(&self.web_version_url).await?;
        body.pointer("/web/updated_at")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| PollError::Body("missing web.updated_at field".to_string()))
    }
}

#[derive(Debug, Default)]
struct CycleState {
    last_change_token: Option<String>,
    last_web_version: Option<String>,
    tick_count: u64,
}

/// Control-surface snapshot of the poller.
#[derive(Clone, Debug, Serialize)]
pub struct RefreshStatus {
    pub enabled: bool,
    pub visible: bool,
    pub tick_count: u64,
    pub last_change_token: Option<String>,
    pub last_web_version: Option<String>,
}

pub struct RefreshPoller {
    config: PollerConfig,
    probe: Arc<dyn ChangeProbe>,
    bus: broadcast::Sender<Refresh>,
    state: Mutex<CycleState>,
    enabled: AtomicBool,
    visible: AtomicBool,
    current_route: Mutex<Option<String>>,
}

/// Handle for the poll loop spawned by [`RefreshPoller::spawn`].
pub struct PollerHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Stop scheduling future ticks; an in-flight tick is not cancelled.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl RefreshPoller {
    pub fn new(config: PollerConfig, probe: Arc<dyn ChangeProbe>) -> Arc<Self> {
        let config = config.clamped();
        let enabled = config
            .state_path
            .as_deref()
            .map(persist::load_enabled)
            .unwrap_or(true);
        let (bus, _) = broadcast::channel(32);
        Arc::new(Self {
            config,
            probe,
            bus,
            state: Mutex::new(CycleState::default()),
            enabled: AtomicBool::new(enabled),
            visible: AtomicBool::new(true),
            current_route: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Refresh> {
        self.bus.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Stop scheduling work on future ticks and persist the choice.
    pub fn pause(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.persist_enabled(false);
        info!(target: "live_refresh", "refresh polling paused");
    }

    pub fn resume(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.persist_enabled(true);
        info!(target: "live_refresh", "refresh polling resumed");
    }

    /// Ticks are no-ops while the page is hidden.
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    pub fn set_current_route(&self, route: Option<String>) {
        *self.current_route.lock() = route;
    }

    pub fn status(&self) -> RefreshStatus {
        let state = self.state.lock();
        RefreshStatus {
            enabled: self.enabled.load(Ordering::SeqCst),
            visible: self.visible.load(Ordering::SeqCst),
            tick_count: state.tick_count,
            last_change_token: state.last_change_token.clone(),
            last_web_version: state.last_web_version.clone(),
        }
    }

    /// Run the poll loop on a fixed interval until the handle shuts it
    /// down. A tick that is still awaiting I/O when the next interval
    /// fires does not delay it; both are allowed to proceed.
    pub fn spawn(self: &Arc<Self>) -> PollerHandle {
        let poller = Arc::clone(self);
        let cancel = CancellationToken::new();
        let loop_token = cancel.clone();
        let tick_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first interval tick resolves immediately; skip it so the
            // initial poll lands one full period after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        let poller = Arc::clone(&poller);
                        tokio::spawn(async move {
                            poller.tick().await;
                        });
                    }
                }
            }
        });
        PollerHandle {
            cancel,
            task: Some(task),
        }
    }

    /// One poll cycle. Public so control surfaces and tests can drive the
    /// poller without the interval timer.
    pub async fn tick(&self) {
        if !self.enabled.load(Ordering::SeqCst) || !self.visible.load(Ordering::SeqCst) {
            return;
        }
        let tick_no = {
            let mut state = self.state.lock();
            state.tick_count += 1;
            state.tick_count
        };
        metrics::record_tick();

        let mut data_refreshed = false;
        match self.probe.change_token().await {
            Ok(token) => {
                let mut state = self.state.lock();
                match state.last_change_token.as_deref() {
                    None => {
                        // First observation seeds the baseline silently.
                        state.last_change_token = Some(token);
                    }
                    Some(previous) if previous != token => {
                        state.last_change_token = Some(token.clone());
                        drop(state);
                        data_refreshed = true;
                        self.broadcast(Refresh::DataChanged { token });
                    }
                    _ => {}
                }
            }
            Err(err) => {
                // Best-effort: treat as "no change" this tick.
                debug!(target: "live_refresh", %err, "change token unavailable");
            }
        }

        if tick_no % self.config.version_check_every == 0 {
            match self.probe.web_version().await {
                Ok(version) => {
                    let mut state = self.state.lock();
                    match state.last_web_version.as_deref() {
                        None => {
                            state.last_web_version = Some(version);
                        }
                        Some(previous) if previous != version => {
                            state.last_web_version = Some(version.clone());
                            drop(state);
                            info!(
                                target: "live_refresh",
                                %version,
                                "web bundle changed, full reload required"
                            );
                            self.broadcast(Refresh::ReloadRequired { version });
                        }
                        _ => {}
                    }
                }
                Err(err) => {
                    debug!(target: "live_refresh", %err, "web version unavailable");
                }
            }
        }

        if data_refreshed && tick_no % self.config.router_refresh_every == 0 && !self.route_exempt()
        {
            self.broadcast(Refresh::RouterRefresh);
        }
    }

    fn route_exempt(&self) -> bool {
        let route = self.current_route.lock();
        match route.as_deref() {
            Some(route) => self.config.exempt_routes.iter().any(|r| r == route),
            None => false,
        }
    }

    fn broadcast(&self, signal: Refresh) {
        metrics::record_signal(signal.kind());
        // No receivers is fine; signals are best-effort.
        let _ = self.bus.send(signal);
    }

    fn persist_enabled(&self, enabled: bool) {
        if let Some(path) = self.config.state_path.as_deref() {
            persist::store_enabled(path, enabled);
        }
    }
}
