//! Prometheus metrics
//!
//! Metrics live in the default registry so `/metrics` can gather them with
//! `prometheus::gather()`. Registration happens on first use; if it fails
//! the recorders become no-ops.

use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};
use std::sync::OnceLock;
use tracing::warn;

pub struct Metrics {
    pub inventory_updates: IntCounterVec,
    pub migration_vms: IntGaugeVec,
    pub admission_requests: IntCounterVec,
}

impl Metrics {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            inventory_updates: register_int_counter_vec!(
                "forklift_inventory_updates_total",
                "Source object updates applied to the inventory",
                &["provider"]
            )?,
            migration_vms: register_int_gauge_vec!(
                "forklift_migration_vms",
                "Migrating VMs by phase",
                &["phase"]
            )?,
            admission_requests: register_int_counter_vec!(
                "forklift_admission_requests_total",
                "Admission reviews by resource kind and outcome",
                &["kind", "allowed"]
            )?,
        })
    }
}

/// Process-wide metrics, registered on first call.
pub fn metrics() -> Option<&'static Metrics> {
    static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();
    METRICS
        .get_or_init(|| match Metrics::register() {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(error = %e, "Metric registration failed");
                None
            }
        })
        .as_ref()
}

pub fn record_inventory_updates(provider: &str, count: u64) {
    if let Some(m) = metrics() {
        m.inventory_updates.with_label_values(&[provider]).inc_by(count);
    }
}

pub fn set_migration_vms(phase: &str, count: i64) {
    if let Some(m) = metrics() {
        m.migration_vms.with_label_values(&[phase]).set(count);
    }
}

pub fn record_admission(kind: &str, allowed: bool) {
    if let Some(m) = metrics() {
        let allowed = if allowed { "true" } else { "false" };
        m.admission_requests.with_label_values(&[kind, allowed]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_gathered() {
        record_inventory_updates("p1", 3);
        record_admission("secret", true);
        set_migration_vms("CopyDisks", 2);

        let m = metrics().unwrap();
        assert!(m.inventory_updates.with_label_values(&["p1"]).get() >= 3);
        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "forklift_inventory_updates_total"));
        assert!(names.iter().any(|n| n == "forklift_admission_requests_total"));
    }
}
