use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntCounterVec, Registry};
use tracing::error;

lazy_static! {
    static ref POLL_TICKS_TOTAL: IntCounter = IntCounter::new(
        "pagepulse_poll_ticks_total",
        "Refresh poller ticks executed",
    )
    .unwrap();
    static ref REFRESH_SIGNALS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "pagepulse_refresh_signals_total",
            "Refresh signals broadcast by kind",
        ),
        &["kind"]
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register live refresh metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, POLL_TICKS_TOTAL.clone());
    register(registry, REFRESH_SIGNALS_TOTAL.clone());
}

pub fn record_tick() {
    POLL_TICKS_TOTAL.inc();
}

pub fn record_signal(kind: &str) {
    REFRESH_SIGNALS_TOTAL.with_label_values(&[kind]).inc();
}
