use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntCounterVec, Registry};
use tracing::error;

lazy_static! {
    static ref HEALTH_CHECKS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "pagepulse_health_checks_total",
            "Health proxy outcomes by discriminator",
        ),
        &["outcome"]
    )
    .unwrap();
    static ref BREAKER_OPENED_TOTAL: IntCounter = IntCounter::new(
        "pagepulse_breaker_opened_total",
        "Times the health circuit breaker tripped open",
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register health breaker metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, HEALTH_CHECKS_TOTAL.clone());
    register(registry, BREAKER_OPENED_TOTAL.clone());
}

pub fn record_check(outcome: &str) {
    HEALTH_CHECKS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_breaker_opened() {
    BREAKER_OPENED_TOTAL.inc();
}
