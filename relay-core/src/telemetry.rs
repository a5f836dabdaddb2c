use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;

use crate::queue::Platform;
use crate::rotation::TokenType;

/// One-time metrics registration so every series shows up on scrape.
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "relay_items_ingested_total",
            "Source items inserted or updated by a poll."
        );
        describe_counter!(
            "relay_items_scheduled_total",
            "Dispatch records created."
        );
        describe_counter!(
            "relay_items_fired_total",
            "Dispatch records enqueued to a platform queue."
        );
        describe_counter!(
            "relay_dispatch_failures_total",
            "Enqueue failures while firing dispatch records."
        );
        describe_counter!(
            "relay_dispatch_parked_total",
            "Dispatch records parked after exhausting retries."
        );
        describe_counter!("relay_source_errors_total", "Source fetch/parse errors.");
        describe_counter!(
            "relay_rotation_succeeded_total",
            "Completed credential rotations."
        );
        describe_counter!(
            "relay_rotation_failed_total",
            "Abandoned credential rotations."
        );
    });
}

pub(crate) fn record_ingested(source: &str, count: usize) {
    ensure_metrics_described();
    counter!("relay_items_ingested_total", "source" => source.to_string()).increment(count as u64);
}

pub(crate) fn record_scheduled(source: &str, count: usize) {
    ensure_metrics_described();
    counter!("relay_items_scheduled_total", "source" => source.to_string()).increment(count as u64);
}

pub(crate) fn record_source_error(source: &str) {
    ensure_metrics_described();
    counter!("relay_source_errors_total", "source" => source.to_string()).increment(1);
}

pub(crate) fn record_fired(platform: Platform) {
    ensure_metrics_described();
    counter!("relay_items_fired_total", "queue" => platform.queue_name()).increment(1);
}

pub(crate) fn record_dispatch_failure(parked: bool) {
    ensure_metrics_described();
    counter!("relay_dispatch_failures_total").increment(1);
    if parked {
        counter!("relay_dispatch_parked_total").increment(1);
    }
}

pub(crate) fn record_rotation(token: TokenType, succeeded: bool) {
    ensure_metrics_described();
    if succeeded {
        counter!("relay_rotation_succeeded_total", "token" => token.as_str()).increment(1);
    } else {
        counter!("relay_rotation_failed_total", "token" => token.as_str()).increment(1);
    }
}
