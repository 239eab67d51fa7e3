use crate::errors::Result;
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref PUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_published_total",
        "Total telemetry records acknowledged by the broker"
    ))
    .expect("valid metric options");
    pub static ref PUBLISH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_publish_failures_total",
        "Total telemetry records that failed to publish"
    ))
    .expect("valid metric options");
    pub static ref CONSUME_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "relay_consume_total",
            "Total bounded consume calls by outcome"
        ),
        &["outcome"]
    )
    .expect("valid metric options");
    pub static ref CONSUME_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "relay_consume_duration_seconds",
            "Wall-clock time spent in a bounded consume call"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    )
    .expect("valid metric options");
    pub static ref OPEN_SUBSCRIPTIONS: Gauge = Gauge::with_opts(Opts::new(
        "relay_open_subscriptions",
        "Subscriptions currently held open by consume calls"
    ))
    .expect("valid metric options");
}

pub fn init_metrics() -> Result<()> {
    REGISTRY.register(Box::new(PUBLISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PUBLISH_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONSUME_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONSUME_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(OPEN_SUBSCRIPTIONS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> std::result::Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Tracks one open subscription in [`OPEN_SUBSCRIPTIONS`]; the gauge is
/// decremented when the guard is dropped.
#[derive(Debug)]
pub struct SubscriptionGauge(());

impl SubscriptionGauge {
    pub fn acquire() -> Self {
        OPEN_SUBSCRIPTIONS.inc();
        SubscriptionGauge(())
    }
}

impl Drop for SubscriptionGauge {
    fn drop(&mut self) {
        OPEN_SUBSCRIPTIONS.dec();
    }
}
