//! Circuit-breaker guarded health proxy.
//!
//! Shields the backend health endpoint from repeated probing while it is
//! known to be down, and shields callers from slow timeouts during an
//! outage. After `failure_threshold` consecutive failures the breaker
//! opens for `cooldown_window_ms`; while open, [`HealthProxy::check`]
//! fast-fails with a cooldown result and never contacts upstream. Every
//! outcome emits one runtime-beacon record tagged `cooldown`, `live`, or
//! `upstream_failure` so operators can tell "refused to try" apart from
//! "upstream actually failed".

pub mod metrics;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::warn;

use pagepulse_beacon::{BeaconSink, RuntimeBeacon};

#[derive(Clone, Debug, Serialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open once tripped.
    pub cooldown_window_ms: u64,
    /// Bound on each upstream probe.
    pub probe_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            cooldown_window_ms: 30_000,
            probe_timeout_ms: 15_000,
        }
    }
}

impl BreakerConfig {
    /// Floors prevent a pathological zero-length cooldown loop.
    pub fn clamped(mut self) -> Self {
        self.failure_threshold = self.failure_threshold.max(1);
        self.cooldown_window_ms = self.cooldown_window_ms.max(1000);
        self.probe_timeout_ms = self.probe_timeout_ms.max(1000);
        self
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

/// Failure counting and cooldown bookkeeping, process-wide per upstream.
///
/// Mutated only in synchronous continuations after an awaited probe
/// resolves, so no two checks interleave a field update mid-write.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: u32,
    cooldown_window: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_window: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            failure_threshold: failure_threshold.max(1),
            cooldown_window: cooldown_window.max(Duration::from_millis(1000)),
        }
    }

    /// Remaining cooldown, or `None` when calls may go upstream.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let state = self.state.lock();
        let until = state.cooldown_until?;
        if now < until {
            Some(until - now)
        } else {
            None
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.cooldown_until = None;
    }

    /// Returns true when this failure tripped the breaker open. The
    /// counter resets on open, so the breaker cannot re-open until it
    /// fails `failure_threshold` more times after the cooldown expires.
    pub fn record_failure(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold {
            state.cooldown_until = Some(now + self.cooldown_window);
            state.consecutive_failures = 0;
            true
        } else {
            false
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("upstream probe timed out after {0}ms")]
    Timeout(u64),
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("upstream body unparsable: {0}")]
    Body(String),
}

impl ProbeError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status(code) => Some(*code),
            _ => None,
        }
    }
}

/// Seam over the upstream health endpoint so tests can count probe
/// attempts on a stub.
#[async_trait]
pub trait UpstreamProbe: Send + Sync {
    async fn fetch_health(&self) -> Result<Value, ProbeError>;
}

/// Production probe: GET the backend health URL with a bounded timeout.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(client: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }
}

#[async_trait]
impl UpstreamProbe for HttpHealthProbe {
    async fn fetch_health(&self) -> Result<Value, ProbeError> {
        let response = tokio::time::timeout(self.timeout, self.client.get(&self.url).send())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|err| ProbeError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        response
            .json()
            .await
            .map_err(|err| ProbeError::Body(err.to_string()))
    }
}

/// Local process metadata attached to every proxy response.
#[derive(Clone, Debug, Serialize)]
pub struct WebStatus {
    pub status: String,
    pub started_at: String,
    pub uptime_seconds: u64,
    pub uptime_human: String,
    pub updated_at: String,
}

#[derive(Clone, Debug)]
pub enum HealthVerdict {
    /// Upstream answered; its payload is passed through untouched.
    Live { api: Value },
    /// Breaker is open; upstream was not contacted.
    Cooldown { retry_after_seconds: u64 },
    /// Upstream was contacted and failed.
    UpstreamFailure {
        details: String,
        retry_after_seconds: Option<u64>,
    },
}

#[derive(Clone, Debug)]
pub struct HealthReport {
    pub verdict: HealthVerdict,
    pub web: WebStatus,
    pub checked_at: String,
}

pub struct HealthProxy {
    breaker: CircuitBreaker,
    probe: Arc<dyn UpstreamProbe>,
    sink: Arc<dyn BeaconSink>,
    api_url: String,
    started_wall: DateTime<Utc>,
    started_mono: Instant,
    build_stamp: String,
}

impl HealthProxy {
    pub fn new(
        config: BreakerConfig,
        probe: Arc<dyn UpstreamProbe>,
        sink: Arc<dyn BeaconSink>,
        api_url: String,
        build_stamp: String,
    ) -> Self {
        let config = config.clamped();
        Self {
            breaker: CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_millis(config.cooldown_window_ms),
            ),
            probe,
            sink,
            api_url,
            started_wall: Utc::now(),
            started_mono: Instant::now(),
            build_stamp,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn check(&self) -> HealthReport {
        let checked_at = Utc::now().to_rfc3339();

        if let Some(remaining) = self.breaker.cooldown_remaining(Instant::now()) {
            let retry_after_seconds = remaining.as_secs().max(1);
            self.emit("cooldown", None, 0);
            metrics::record_check("cooldown");
            return HealthReport {
                verdict: HealthVerdict::Cooldown {
                    retry_after_seconds,
                },
                web: self.web_status("degraded"),
                checked_at,
            };
        }

        let started = Instant::now();
        match self.probe.fetch_health().await {
            Ok(api) => {
                self.breaker.record_success();
                self.emit("live", Some(200), started.elapsed().as_millis() as u64);
                metrics::record_check("live");
                HealthReport {
                    verdict: HealthVerdict::Live { api },
                    web: self.web_status("ok"),
                    checked_at,
                }
            }
            Err(err) => {
                let runtime_ms = started.elapsed().as_millis() as u64;
                let now = Instant::now();
                if self.breaker.record_failure(now) {
                    warn!(
                        target: "health_proxy",
                        api_url = %self.api_url,
                        cooldown_ms = self.breaker.cooldown_window.as_millis() as u64,
                        "circuit breaker opened after repeated health failures"
                    );
                    metrics::record_breaker_opened();
                }
                let retry_after_seconds = self
                    .breaker
                    .cooldown_remaining(now)
                    .map(|remaining| remaining.as_secs().max(1));
                self.emit("upstream_failure", err.status_code(), runtime_ms);
                metrics::record_check("upstream_failure");
                HealthReport {
                    verdict: HealthVerdict::UpstreamFailure {
                        details: err.to_string(),
                        retry_after_seconds,
                    },
                    web: self.web_status("degraded"),
                    checked_at,
                }
            }
        }
    }

    fn web_status(&self, status: &str) -> WebStatus {
        let uptime_seconds = self.started_mono.elapsed().as_secs();
        WebStatus {
            status: status.to_string(),
            started_at: self.started_wall.to_rfc3339(),
            uptime_seconds,
            uptime_human: humanize_uptime(uptime_seconds),
            updated_at: self.build_stamp.clone(),
        }
    }

    fn emit(&self, outcome: &str, status_code: Option<u16>, runtime_ms: u64) {
        self.sink.dispatch(RuntimeBeacon {
            source: "health_proxy".to_string(),
            endpoint: "/api/health".to_string(),
            method: "GET".to_string(),
            status_code,
            runtime_ms,
            metadata: json!({ "outcome": outcome }),
        });
    }
}

/// `90061` → `"1d 1h 1m 1s"`.
pub fn humanize_uptime(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    parts.push(format!("{}s", seconds));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagepulse_beacon::MemorySink;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubProbe {
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl StubProbe {
        fn new(failing: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(failing),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl UpstreamProbe for StubProbe {
        async fn fetch_health(&self) -> Result<Value, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(ProbeError::Transport("connection refused".to_string()))
            } else {
                Ok(json!({ "status": "ok" }))
            }
        }
    }

    fn proxy_with(probe: Arc<StubProbe>, sink: Arc<MemorySink>) -> HealthProxy {
        HealthProxy::new(
            BreakerConfig::default(),
            probe,
            sink,
            "http://backend.internal/api/health".to_string(),
            "2026-08-30".to_string(),
        )
    }

    fn outcome_of(beacon: &RuntimeBeacon) -> &str {
        beacon.metadata["outcome"].as_str().unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fast_fails_during_cooldown() {
        let probe = StubProbe::new(true);
        let sink = MemorySink::new();
        let proxy = proxy_with(probe.clone(), sink.clone());

        // Failures at t=0 and t=1000 trip the threshold of 2.
        let report = proxy.check().await;
        assert!(matches!(
            report.verdict,
            HealthVerdict::UpstreamFailure { .. }
        ));
        tokio::time::advance(Duration::from_millis(1000)).await;
        let report = proxy.check().await;
        match report.verdict {
            HealthVerdict::UpstreamFailure {
                retry_after_seconds,
                ..
            } => assert_eq!(retry_after_seconds, Some(30)),
            other => panic!("expected failure verdict, got {:?}", other),
        }
        assert_eq!(probe.calls(), 2);

        // t=1500: fast-fail without an upstream attempt.
        tokio::time::advance(Duration::from_millis(500)).await;
        let report = proxy.check().await;
        match report.verdict {
            HealthVerdict::Cooldown {
                retry_after_seconds,
            } => assert_eq!(retry_after_seconds, 29),
            other => panic!("expected cooldown verdict, got {:?}", other),
        }
        assert_eq!(probe.calls(), 2);
        assert_eq!(report.web.status, "degraded");

        // t=31000: cooldown expired, upstream is attempted again.
        tokio::time::advance(Duration::from_millis(29_500)).await;
        let _ = proxy.check().await;
        assert_eq!(probe.calls(), 3);

        let outcomes: Vec<String> = sink
            .records()
            .iter()
            .map(|b| outcome_of(b).to_string())
            .collect();
        assert_eq!(
            outcomes,
            vec![
                "upstream_failure",
                "upstream_failure",
                "cooldown",
                "upstream_failure"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_counter() {
        let probe = StubProbe::new(true);
        let sink = MemorySink::new();
        let proxy = proxy_with(probe.clone(), sink.clone());

        let _ = proxy.check().await; // one failure, below threshold
        assert_eq!(proxy.breaker().consecutive_failures(), 1);

        probe.set_failing(false);
        let report = proxy.check().await;
        assert!(matches!(report.verdict, HealthVerdict::Live { .. }));
        assert_eq!(proxy.breaker().consecutive_failures(), 0);

        // A single failure right after a success never opens the breaker.
        probe.set_failing(true);
        let report = proxy.check().await;
        match report.verdict {
            HealthVerdict::UpstreamFailure {
                retry_after_seconds,
                ..
            } => assert_eq!(retry_after_seconds, None),
            other => panic!("expected failure verdict, got {:?}", other),
        }
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn live_result_wraps_upstream_payload_and_process_metadata() {
        let probe = StubProbe::new(false);
        let sink = MemorySink::new();
        let proxy = proxy_with(probe, sink.clone());

        tokio::time::advance(Duration::from_secs(65)).await;
        let report = proxy.check().await;
        match report.verdict {
            HealthVerdict::Live { api } => assert_eq!(api["status"], "ok"),
            other => panic!("expected live verdict, got {:?}", other),
        }
        assert_eq!(report.web.status, "ok");
        assert_eq!(report.web.uptime_seconds, 65);
        assert_eq!(report.web.uptime_human, "1m 5s");
        assert_eq!(report.web.updated_at, "2026-08-30");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(outcome_of(&records[0]), "live");
        assert_eq!(records[0].source, "health_proxy");
    }

    #[test]
    fn config_clamps_to_sane_floors() {
        let config = BreakerConfig {
            failure_threshold: 0,
            cooldown_window_ms: 0,
            probe_timeout_ms: 5,
        }
        .clamped();
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.cooldown_window_ms, 1000);
        assert_eq!(config.probe_timeout_ms, 1000);
    }

    #[test]
    fn humanizes_uptime() {
        assert_eq!(humanize_uptime(0), "0s");
        assert_eq!(humanize_uptime(61), "1m 1s");
        assert_eq!(humanize_uptime(90_061), "1d 1h 1m 1s");
    }
}
