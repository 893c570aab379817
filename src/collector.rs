//! Metrics collector trait and snapshot type

use serde::{Deserialize, Serialize};

use crate::Result;

/// One host metrics sample.
///
/// Percentages are in `0.0..=100.0`. Rates are bytes per second since the previous
/// sample of the same collector, and zero on the first sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Unix seconds.
    pub ts: i64,

    pub cpu: f64,
    pub mem: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub mem_total_bytes: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub mem_used_bytes: u64,

    pub disk: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub disk_total_bytes: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub disk_used_bytes: u64,

    pub swap: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub swap_total_bytes: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub swap_used_bytes: u64,

    pub bytes_up_total: u64,
    pub bytes_down_total: u64,
    pub net_up_bps: u64,
    pub net_down_bps: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Source of host metrics.
///
/// Collectors are stateful: throughput and CPU figures are derived from the
/// counters seen on the previous call. A failed call only skips that cycle.
#[async_trait::async_trait]
pub trait MetricsCollector: Send + 'static {
    /// Take one sample.
    ///
    /// Returns `Err` only when nothing at all could be read.
    async fn collect(&mut self) -> Result<MetricsSnapshot>;
}

/// Percentage of `used` in `total`, zero when `total` is zero.
pub(crate) fn percent(used: u64, total: u64) -> f64 {
    if total == 0 { 0.0 } else { used as f64 * 100.0 / total as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_byte_fields_are_omitted() {
        let snapshot = MetricsSnapshot { ts: 10, cpu: 1.5, net_up_bps: 7, ..Default::default() };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["ts"], 10);
        assert_eq!(value["net_up_bps"], 7);
        assert_eq!(value["bytes_down_total"], 0);
        assert!(value.get("mem_total_bytes").is_none());
        assert!(value.get("disk_used_bytes").is_none());
    }

    #[test]
    fn percent_handles_empty_totals() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }
}
