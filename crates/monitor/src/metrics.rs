use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec_with_registry, Encoder, IntCounterVec, Registry, TextEncoder};

use crate::{Error, Result};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref CHECKS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "proxy_monitor_checks_total",
        "Total number of entity checks run, by check.",
        &["check"],
        REGISTRY
    )
    .expect("checks_total is registered once");
    pub static ref CHECK_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "proxy_monitor_check_failures_total",
        "Entity checks that failed or timed out, by check.",
        &["check"],
        REGISTRY
    )
    .expect("check_failures_total is registered once");
    pub static ref CHECKS_SKIPPED_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "proxy_monitor_checks_skipped_total",
        "Entity checks skipped because one was already in flight, by check.",
        &["check"],
        REGISTRY
    )
    .expect("checks_skipped_total is registered once");
    pub static ref ALERTS_OPENED_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "proxy_monitor_alerts_opened_total",
        "Alert records opened, by kind.",
        &["kind"],
        REGISTRY
    )
    .expect("alerts_opened_total is registered once");
    pub static ref ALERTS_RECOVERED_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "proxy_monitor_alerts_recovered_total",
        "Alert records resolved, by kind.",
        &["kind"],
        REGISTRY
    )
    .expect("alerts_recovered_total is registered once");
    pub static ref NOTIFICATIONS_SENT_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "proxy_monitor_notifications_sent_total",
        "Notifications delivered, by channel.",
        &["channel"],
        REGISTRY
    )
    .expect("notifications_sent_total is registered once");
    pub static ref NOTIFICATIONS_FAILED_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "proxy_monitor_notifications_failed_total",
        "Notification deliveries that failed, by channel.",
        &["channel"],
        REGISTRY
    )
    .expect("notifications_failed_total is registered once");
}

// Gather metrics for exposition
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        CHECKS_TOTAL.with_label_values(&["availability"]).inc();
        let text = gather_metrics().unwrap();
        assert!(text.contains("proxy_monitor_checks_total"));
        assert!(text.contains("check=\"availability\""));
    }
}
