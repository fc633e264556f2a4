use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntCounterVec, Registry};
use tracing::error;

lazy_static! {
    static ref VIEW_SESSIONS_OPENED_TOTAL: IntCounter = IntCounter::new(
        "pagepulse_view_sessions_opened_total",
        "View sessions opened after the sampling gate",
    )
    .unwrap();
    static ref VIEW_SESSIONS_UNSAMPLED_TOTAL: IntCounter = IntCounter::new(
        "pagepulse_view_sessions_unsampled_total",
        "Navigations skipped by the sampling gate",
    )
    .unwrap();
    static ref VIEW_BEACONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("pagepulse_view_beacons_total", "View beacons emitted"),
        &["reason"]
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register view tracker metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, VIEW_SESSIONS_OPENED_TOTAL.clone());
    register(registry, VIEW_SESSIONS_UNSAMPLED_TOTAL.clone());
    register(registry, VIEW_BEACONS_TOTAL.clone());
}

pub fn record_session_opened() {
    VIEW_SESSIONS_OPENED_TOTAL.inc();
}

pub fn record_unsampled() {
    VIEW_SESSIONS_UNSAMPLED_TOTAL.inc();
}

pub fn record_beacon(reason: &str) {
    VIEW_BEACONS_TOTAL.with_label_values(&[reason]).inc();
}
