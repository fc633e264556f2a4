//! View lifecycle tracking.
//!
//! A [`ViewTracker`] owns at most one live [`ViewSession`] at a time. The
//! session opens on navigation (subject to a sampling gate), aggregates
//! bookkeeping from every instrumented call attributed to it, and emits a
//! single beacon when the first of idle settle, hard timeout, unmount, or
//! the next navigation finalizes it. Finalization is single-fire: repeated
//! triggers are no-ops once the session is gone.

pub mod config;
pub mod instrument;
pub mod metrics;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::warn;
use uuid::Uuid;

use pagepulse_beacon::{BeaconSink, RuntimeBeacon};

use crate::config::TrackerConfig;

/// Anchor for the very first session of the process, recorded at first
/// tracker construction so early backend work is attributed to it.
static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Which finalize trigger fired first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinalizeReason {
    Idle,
    MaxWait,
    Unmount,
    RouteChange,
}

impl FinalizeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::MaxWait => "max_wait",
            Self::Unmount => "unmount",
            Self::RouteChange => "route_change",
        }
    }
}

/// One sampled navigation and the backend work it triggered.
#[derive(Clone, Debug)]
pub struct ViewSession {
    pub id: Uuid,
    pub route: String,
    pub started_at: Instant,
    pub api_call_count: u64,
    pub api_endpoints: HashSet<String>,
    pub api_runtime_ms: u64,
    pub api_runtime_cost: f64,
    pub active_requests: u32,
    pub finalized: bool,
}

impl ViewSession {
    fn new(route: &str, started_at: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            route: route.to_string(),
            started_at,
            api_call_count: 0,
            api_endpoints: HashSet::new(),
            api_runtime_ms: 0,
            api_runtime_cost: 0.0,
            active_requests: 0,
            finalized: false,
        }
    }
}

#[derive(Clone, Copy)]
enum TimerKind {
    Idle,
    MaxWait,
}

struct ActiveSession {
    session: ViewSession,
    /// Bumped on every re-arm so a stale idle timer firing late is inert.
    idle_epoch: u64,
    idle_task: Option<JoinHandle<()>>,
    timeout_task: Option<JoinHandle<()>>,
}

/// Process-wide tracker with a narrow lifecycle surface: open a view,
/// attribute calls to it, finalize it exactly once.
pub struct ViewTracker {
    config: TrackerConfig,
    sink: Arc<dyn BeaconSink>,
    current: Mutex<Option<ActiveSession>>,
    first_session_opened: AtomicBool,
}

impl ViewTracker {
    pub fn new(config: TrackerConfig, sink: Arc<dyn BeaconSink>) -> Arc<Self> {
        Lazy::force(&PROCESS_START);
        Arc::new(Self {
            config: config.clamped(),
            sink,
            current: Mutex::new(None),
            first_session_opened: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Finalize any live session with reason `route_change`, then open a
    /// new session for the new route subject to the sampling gate.
    ///
    /// Returns `None` for unsampled navigations; instrumented calls during
    /// that window are cheap no-ops.
    pub fn open_view(self: &Arc<Self>, route: &str) -> Option<ViewHandle> {
        let mut slot = self.current.lock();
        self.finalize_slot(&mut slot, FinalizeReason::RouteChange);

        if !self.sampled() {
            metrics::record_unsampled();
            return None;
        }

        let started_at = if self.first_session_opened.swap(true, Ordering::SeqCst) {
            Instant::now()
        } else {
            *PROCESS_START
        };
        let session = ViewSession::new(route, started_at);
        let id = session.id;
        let mut active = ActiveSession {
            session,
            idle_epoch: 0,
            idle_task: None,
            timeout_task: None,
        };
        active.timeout_task = self.spawn_timer(
            id,
            Duration::from_millis(self.config.max_wait_ms),
            TimerKind::MaxWait,
            0,
        );
        self.arm_idle(&mut active);
        *slot = Some(active);
        metrics::record_session_opened();

        Some(ViewHandle {
            tracker: Arc::downgrade(self),
            id,
        })
    }

    /// Attribute the start of a trackable call to the live session, if any.
    pub fn begin_call(self: &Arc<Self>, endpoint: &str) -> Option<CallToken> {
        let mut slot = self.current.lock();
        let active = slot.as_mut()?;
        if active.session.finalized {
            return None;
        }
        active.session.api_call_count += 1;
        active.session.api_endpoints.insert(endpoint.to_string());
        active.session.active_requests += 1;
        let session_id = active.session.id;
        let route = active.session.route.clone();
        self.arm_idle(active);
        Some(CallToken {
            tracker: Arc::downgrade(self),
            session_id,
            route,
            settled: false,
        })
    }

    /// Finalize whatever session is live. Idempotent.
    pub fn finalize_current(&self, reason: FinalizeReason) {
        let mut slot = self.current.lock();
        self.finalize_slot(&mut slot, reason);
    }

    /// Snapshot of the live session, for control surfaces and tests.
    pub fn current_session(&self) -> Option<ViewSession> {
        self.current.lock().as_ref().map(|a| a.session.clone())
    }

    fn sampled(&self) -> bool {
        self.config.sample_rate >= 1.0
            || rand::thread_rng().gen::<f64>() < self.config.sample_rate
    }

    fn spawn_timer(
        self: &Arc<Self>,
        id: Uuid,
        delay: Duration,
        kind: TimerKind,
        epoch: u64,
    ) -> Option<JoinHandle<()>> {
        if Handle::try_current().is_err() {
            warn!(target: "view_tracker", "no async runtime, session timers disabled");
            return None;
        }
        let tracker = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            sleep(delay).await;
            let Some(tracker) = tracker.upgrade() else {
                return;
            };
            match kind {
                TimerKind::Idle => tracker.idle_fired(id, epoch),
                TimerKind::MaxWait => tracker.finalize_if(id, FinalizeReason::MaxWait),
            }
        }))
    }

    fn arm_idle(self: &Arc<Self>, active: &mut ActiveSession) {
        active.idle_epoch += 1;
        if let Some(task) = active.idle_task.take() {
            task.abort();
        }
        active.idle_task = self.spawn_timer(
            active.session.id,
            Duration::from_millis(self.config.idle_settle_ms),
            TimerKind::Idle,
            active.idle_epoch,
        );
    }

    fn idle_fired(self: &Arc<Self>, id: Uuid, epoch: u64) {
        let mut slot = self.current.lock();
        let should_finalize = match slot.as_mut() {
            Some(active)
                if active.session.id == id
                    && active.idle_epoch == epoch
                    && !active.session.finalized =>
            {
                if active.session.active_requests == 0 {
                    true
                } else {
                    // Calls still in flight at fire time; settle again
                    // rather than ending the session mid-request.
                    self.arm_idle(active);
                    false
                }
            }
            _ => return,
        };
        if should_finalize {
            self.finalize_slot(&mut slot, FinalizeReason::Idle);
        }
    }

    fn finalize_if(self: &Arc<Self>, id: Uuid, reason: FinalizeReason) {
        let mut slot = self.current.lock();
        if slot.as_ref().map(|a| a.session.id) == Some(id) {
            self.finalize_slot(&mut slot, reason);
        }
    }

    fn finalize_slot(&self, slot: &mut Option<ActiveSession>, reason: FinalizeReason) {
        let Some(mut active) = slot.take() else {
            return;
        };
        if active.session.finalized {
            return;
        }
        active.session.finalized = true;
        if let Some(task) = active.idle_task.take() {
            task.abort();
        }
        if let Some(task) = active.timeout_task.take() {
            task.abort();
        }

        let session = &active.session;
        let runtime_ms = session.started_at.elapsed().as_millis() as u64;
        let beacon = RuntimeBeacon {
            source: "view".to_string(),
            endpoint: session.route.clone(),
            method: "VIEW".to_string(),
            status_code: None,
            runtime_ms,
            metadata: json!({
                "reason": reason.as_str(),
                "api_call_count": session.api_call_count,
                "api_endpoint_count": session.api_endpoints.len(),
                "api_runtime_ms": session.api_runtime_ms,
                "api_runtime_cost": session.api_runtime_cost,
            }),
        };
        metrics::record_beacon(reason.as_str());
        self.sink.dispatch(beacon);
    }

    fn end_call(self: &Arc<Self>, id: Uuid, runtime_ms: u64, cost: f64) {
        let mut slot = self.current.lock();
        let Some(active) = slot.as_mut() else {
            return;
        };
        if active.session.id != id || active.session.finalized {
            return;
        }
        active.session.active_requests = active.session.active_requests.saturating_sub(1);
        active.session.api_runtime_ms += runtime_ms;
        active.session.api_runtime_cost += cost;
        self.arm_idle(active);
    }

    fn abandon_call(self: &Arc<Self>, id: Uuid) {
        let mut slot = self.current.lock();
        let Some(active) = slot.as_mut() else {
            return;
        };
        if active.session.id != id || active.session.finalized {
            return;
        }
        active.session.active_requests = active.session.active_requests.saturating_sub(1);
        self.arm_idle(active);
    }
}

/// Handle for the instrumented route component. Dropping it while the
/// session is still open finalizes with reason `unmount` (a second, faster
/// navigation tearing the first one down).
pub struct ViewHandle {
    tracker: Weak<ViewTracker>,
    id: Uuid,
}

impl ViewHandle {
    pub fn session_id(&self) -> Uuid {
        self.id
    }
}

impl Drop for ViewHandle {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.finalize_if(self.id, FinalizeReason::Unmount);
        }
    }
}

/// In-flight call attribution. Completion records runtime/cost; dropping
/// an uncompleted token (cancelled request) still releases the in-flight
/// slot so the counter can never stay stuck.
pub struct CallToken {
    tracker: Weak<ViewTracker>,
    session_id: Uuid,
    route: String,
    settled: bool,
}

impl CallToken {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Record completion, preferring the server-reported runtime/cost pair
    /// over the wall-clock measurement when present.
    pub fn complete(
        mut self,
        wall_ms: u64,
        server_runtime_ms: Option<u64>,
        server_cost: Option<f64>,
    ) {
        self.settled = true;
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.end_call(
                self.session_id,
                server_runtime_ms.unwrap_or(wall_ms),
                server_cost.unwrap_or(0.0),
            );
        }
    }
}

impl Drop for CallToken {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.abandon_call(self.session_id);
        }
    }
}

/// Collapse dynamic path segments (numbers, uuids, long hex ids) to a
/// placeholder so routes aggregate by shape rather than by instance.
pub fn normalize_route(path: &str) -> String {
    let mut out = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        if is_dynamic_segment(segment) {
            out.push_str("[id]");
        } else {
            out.push_str(segment);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

fn is_dynamic_segment(segment: &str) -> bool {
    if segment.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if Uuid::parse_str(segment).is_ok() {
        return true;
    }
    segment.len() >= 16 && segment.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagepulse_beacon::MemorySink;

    fn test_config() -> TrackerConfig {
        TrackerConfig {
            sample_rate: 1.0,
            idle_settle_ms: 700,
            max_wait_ms: 20_000,
            ..TrackerConfig::default()
        }
    }

    fn reason_of(beacon: &RuntimeBeacon) -> &str {
        beacon.metadata["reason"].as_str().unwrap_or_default()
    }

    #[test]
    fn normalizes_dynamic_segments() {
        assert_eq!(normalize_route("/project/123/deps"), "/project/[id]/deps");
        assert_eq!(
            normalize_route("/job/0f8fad5b-d9cb-469f-a165-70867728950e"),
            "/job/[id]"
        );
        assert_eq!(normalize_route("/api/search"), "/api/search");
        assert_eq!(normalize_route(""), "/");
    }

    #[tokio::test(start_paused = true)]
    async fn counts_calls_and_distinct_endpoints() {
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(test_config(), sink.clone());
        let _view = tracker.open_view("/project/[id]").expect("sampled");

        for _ in 0..3 {
            let token = tracker.begin_call("/api/deps").expect("live session");
            token.complete(5, None, None);
        }
        let token = tracker.begin_call("/api/advisories").expect("live session");
        token.complete(7, Some(3), Some(0.5));

        let session = tracker.current_session().expect("session open");
        assert_eq!(session.api_call_count, 4);
        assert_eq!(session.api_endpoints.len(), 2);
        assert!(session.api_endpoints.len() as u64 <= session.api_call_count);
        // Server-reported runtime preferred over wall clock for the last call.
        assert_eq!(session.api_runtime_ms, 5 + 5 + 5 + 3);
        assert_eq!(session.active_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_settle_finalizes_after_quiet_period() {
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(test_config(), sink.clone());
        let _view = tracker.open_view("/project/[id]").expect("sampled");

        sleep(Duration::from_millis(10)).await;
        let token = tracker.begin_call("/api/deps").expect("live session");
        sleep(Duration::from_millis(40)).await;
        token.complete(40, None, None);

        // Idle timer re-armed at the call end fires 700ms later.
        sleep(Duration::from_millis(800)).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(reason_of(&records[0]), "idle");
        assert_eq!(records[0].metadata["api_call_count"], 1);
        assert!(records[0].runtime_ms >= 700);
        assert!(tracker.current_session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_defers_while_calls_are_in_flight() {
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(test_config(), sink.clone());
        let _view = tracker.open_view("/project/[id]").expect("sampled");

        let token = tracker.begin_call("/api/slow").expect("live session");
        // Well past the settle delay, but the call is still outstanding.
        sleep(Duration::from_millis(2_000)).await;
        assert!(sink.is_empty());

        token.complete(2_000, None, None);
        sleep(Duration::from_millis(800)).await;
        assert_eq!(sink.len(), 1);
        assert_eq!(reason_of(&sink.records()[0]), "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_bounds_a_call_that_never_settles() {
        let config = TrackerConfig {
            max_wait_ms: 20_000,
            ..test_config()
        };
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(config, sink.clone());
        let _view = tracker.open_view("/project/[id]").expect("sampled");

        let token = tracker.begin_call("/api/hung").expect("live session");
        sleep(Duration::from_millis(20_100)).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(reason_of(&records[0]), "max_wait");
        assert_eq!(records[0].metadata["api_call_count"], 1);

        // The hung call eventually resolving must not re-open or mutate
        // the finalized session.
        token.complete(25_000, None, None);
        assert_eq!(sink.len(), 1);
        assert!(tracker.current_session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn beacon_fires_exactly_once_under_competing_triggers() {
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(test_config(), sink.clone());
        let view = tracker.open_view("/project/[id]").expect("sampled");

        drop(view); // unmount
        tracker.finalize_current(FinalizeReason::RouteChange);
        sleep(Duration::from_millis(1_000)).await; // let any stale timer fire

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(reason_of(&records[0]), "unmount");
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_finalizes_previous_session_first() {
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(test_config(), sink.clone());
        let first = tracker.open_view("/project/[id]").expect("sampled");
        let _second = tracker.open_view("/search").expect("sampled");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint, "/project/[id]");
        assert_eq!(reason_of(&records[0]), "route_change");

        // The stale handle for the first view is inert now.
        drop(first);
        assert_eq!(sink.len(), 1);
        let session = tracker.current_session().expect("second view open");
        assert_eq!(session.route, "/search");
    }

    #[tokio::test(start_paused = true)]
    async fn unsampled_navigation_opens_nothing() {
        let config = TrackerConfig {
            sample_rate: 0.0,
            ..test_config()
        };
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(config, sink.clone());

        assert!(tracker.open_view("/project/[id]").is_none());
        assert!(tracker.begin_call("/api/deps").is_none());
        sleep(Duration::from_millis(2_000)).await;
        assert!(sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_token_releases_the_inflight_slot() {
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(test_config(), sink.clone());
        let _view = tracker.open_view("/project/[id]").expect("sampled");

        let token = tracker.begin_call("/api/deps").expect("live session");
        drop(token); // request future cancelled mid-flight

        let session = tracker.current_session().expect("session open");
        assert_eq!(session.active_requests, 0);
        assert_eq!(session.api_call_count, 1);

        // With nothing in flight the idle path can now finalize.
        sleep(Duration::from_millis(800)).await;
        assert_eq!(sink.len(), 1);
        assert_eq!(reason_of(&sink.records()[0]), "idle");
    }
}
