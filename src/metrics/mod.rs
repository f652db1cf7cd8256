use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;
use tracing::warn;


lazy_static! {
    pub static ref KEEPALIVE_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("registry_keepalive_failures", "Lease keepalive attempts that failed"),
        &["reason"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_RECONNECTS: IntCounterVec = IntCounterVec::new(
        Opts::new("registry_watch_reconnects", "Watch streams re-established after a recoverable failure"),
        &["path"]
    )
    .expect("metric can not be created");

    pub static ref NOTIFICATIONS_DELIVERED: IntCounter = IntCounter::new(
        "registry_notifications_delivered",
        "Listener callbacks queued for dispatch"
    )
    .expect("metric can not be created");

    pub static ref NOTIFICATIONS_DROPPED: IntCounter = IntCounter::new(
        "registry_notifications_dropped",
        "Listener callbacks dropped because the notify queue was full"
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = {
        let registry = Registry::new();
        registry
            .register(Box::new(KEEPALIVE_FAILURES.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(WATCH_RECONNECTS.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(NOTIFICATIONS_DELIVERED.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(NOTIFICATIONS_DROPPED.clone()))
            .expect("collector can be registered");
        registry
    };
}

/// Render every registry metric in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode registry metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        warn!("registry metrics could not be from_utf8'd: {}", e);
        String::new()
    })
}
