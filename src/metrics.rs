use once_cell::sync::{Lazy, OnceCell};
use prometheus::Registry;

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTER_ONCE: OnceCell<()> = OnceCell::new();

/// Register every component's collectors exactly once, no matter how
/// many servers or tests ask for the registry.
pub fn register_metrics() {
    REGISTER_ONCE.get_or_init(|| {
        let registry = global_registry();
        pagepulse_view_tracker::metrics::register_metrics(registry);
        pagepulse_health_breaker::metrics::register_metrics(registry);
        pagepulse_live_refresh::metrics::register_metrics(registry);
    });
}

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}
