//! Host metrics from the operating system via `sysinfo`

use std::path::Path;
use std::time::Instant;

use sysinfo::{Disks, Networks, System};
use tracing::{debug, trace};

use crate::collector::{MetricsCollector, MetricsSnapshot, percent};
use crate::{AgentError, Result};

/// Interface used when auto-selection finds nothing suitable.
pub const FALLBACK_INTERFACE: &str = "eth0";

const VIRTUAL_PREFIXES: [&str; 4] = ["docker", "veth", "br-", "virbr"];

/// Collector reading CPU, memory, swap, root disk and one network interface.
pub struct SystemCollector {
    iface: String,
    system: System,
    cpu_primed: bool,
    previous_net: Option<NetCounters>,
}

#[derive(Debug, Clone, Copy)]
struct NetCounters {
    rx: u64,
    tx: u64,
    at: Instant,
}

impl SystemCollector {
    /// `net_iface` is an interface name, or `"auto"`/empty for heuristic selection.
    pub fn new(net_iface: &str) -> Self {
        Self {
            iface: net_iface.to_owned(),
            system: System::new(),
            cpu_primed: false,
            previous_net: None,
        }
    }

    fn interface(&self, networks: &Networks) -> String {
        if self.iface.is_empty() || self.iface == "auto" {
            pick_interface(networks.list().keys().map(String::as_str))
        } else {
            self.iface.clone()
        }
    }
}

#[async_trait::async_trait]
impl MetricsCollector for SystemCollector {
    async fn collect(&mut self) -> Result<MetricsSnapshot> {
        let now = Instant::now();
        let mut snapshot = MetricsSnapshot { ts: crate::unix_now(), ..Default::default() };

        self.system.refresh_cpu_usage();
        let have_cpu = !self.system.cpus().is_empty();
        if have_cpu && self.cpu_primed {
            snapshot.cpu = f64::from(self.system.global_cpu_usage());
        }
        self.cpu_primed |= have_cpu;

        self.system.refresh_memory();
        snapshot.mem_total_bytes = self.system.total_memory();
        snapshot.mem_used_bytes = self.system.used_memory();
        snapshot.mem = percent(snapshot.mem_used_bytes, snapshot.mem_total_bytes);
        snapshot.swap_total_bytes = self.system.total_swap();
        snapshot.swap_used_bytes = self.system.used_swap();
        snapshot.swap = percent(snapshot.swap_used_bytes, snapshot.swap_total_bytes);

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .or_else(|| disks.list().first());
        if let Some(disk) = root {
            snapshot.disk_total_bytes = disk.total_space();
            snapshot.disk_used_bytes = disk.total_space().saturating_sub(disk.available_space());
            snapshot.disk = percent(snapshot.disk_used_bytes, snapshot.disk_total_bytes);
        }

        let networks = Networks::new_with_refreshed_list();
        let iface = self.interface(&networks);
        let mut have_net = false;
        if let Some(data) = networks.list().get(&iface) {
            have_net = true;
            let current =
                NetCounters { rx: data.total_received(), tx: data.total_transmitted(), at: now };
            snapshot.bytes_down_total = current.rx;
            snapshot.bytes_up_total = current.tx;
            if let Some(previous) = self.previous_net {
                snapshot.net_down_bps = rate(previous.rx, current.rx, previous.at, now);
                snapshot.net_up_bps = rate(previous.tx, current.tx, previous.at, now);
            }
            self.previous_net = Some(current);
        } else {
            trace!(iface = %iface, "network interface not found");
        }

        if !have_cpu && !have_net && snapshot.mem_total_bytes == 0 && snapshot.disk_total_bytes == 0 {
            return Err(AgentError::collector("no metrics available on this platform"));
        }

        debug!(cpu = snapshot.cpu, mem = snapshot.mem, iface = %iface, "collected metrics");
        Ok(snapshot)
    }
}

/// First interface by name that is neither loopback nor a known virtual bridge.
pub fn pick_interface<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let mut candidates: Vec<&str> = names
        .into_iter()
        .filter(|name| *name != "lo" && !VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)))
        .collect();
    candidates.sort_unstable();
    candidates.first().copied().unwrap_or(FALLBACK_INTERFACE).to_owned()
}

/// Bytes per second between two counter readings. A counter that went
/// backwards was reset, so the new raw value counts as the delta.
fn rate(previous: u64, current: u64, since: Instant, now: Instant) -> u64 {
    let elapsed = now.saturating_duration_since(since).as_secs_f64();
    if elapsed <= 0.0 {
        return 0;
    }
    let delta = if current >= previous { current - previous } else { current };
    (delta as f64 / elapsed) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn auto_pick_skips_virtual_interfaces() {
        let names = ["veth12ab", "lo", "docker0", "wlan0", "br-3f2a", "virbr0", "enp3s0"];
        assert_eq!(pick_interface(names), "enp3s0");
    }

    #[test]
    fn auto_pick_falls_back() {
        assert_eq!(pick_interface(["lo", "docker0"]), FALLBACK_INTERFACE);
        assert_eq!(pick_interface(std::iter::empty()), FALLBACK_INTERFACE);
    }

    #[test]
    fn rate_uses_elapsed_time() {
        let start = Instant::now();
        let later = start + Duration::from_secs(2);
        assert_eq!(rate(1000, 3000, start, later), 1000);
        assert_eq!(rate(1000, 1000, start, later), 0);
    }

    #[test]
    fn rate_treats_counter_reset_as_fresh_value() {
        let start = Instant::now();
        let later = start + Duration::from_secs(1);
        assert_eq!(rate(5000, 300, start, later), 300);
        assert_eq!(rate(5, 10, start, start), 0);
    }

    #[tokio::test]
    async fn first_sample_has_zero_rates() {
        let mut collector = SystemCollector::new("auto");
        if let Ok(snapshot) = collector.collect().await {
            assert_eq!(snapshot.net_up_bps, 0);
            assert_eq!(snapshot.net_down_bps, 0);
            assert_eq!(snapshot.cpu, 0.0);
            assert!(snapshot.mem <= 100.0);
            assert!(snapshot.ts > 0);
        }
    }
}
