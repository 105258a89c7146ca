use prometheus::{IntCounter, IntCounterVec, TextEncoder};
use std::sync::LazyLock;

pub static REWRITE_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "beacon_rewrite_count",
        "number of message bodies considered for tracking instrumentation, by outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static DISPATCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "beacon_dispatch_count",
        "number of delivery events sent to the tracking service",
        &["event_type", "result"]
    )
    .unwrap()
});

pub static DISPATCH_BACKLOG: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "beacon_dispatch_backlog_count",
        "number of delivery events that had to wait because max_in_flight was reached"
    )
    .unwrap()
});

/// Render the registered metrics in the prometheus text format
pub fn render_metrics() -> anyhow::Result<String> {
    Ok(TextEncoder::new().encode_to_string(&prometheus::gather())?)
}
