//! Network probes: per-target TCP latency and the one-time public address check.

pub mod netprobe;
pub mod tcpping;

pub use netprobe::{NetProbeResult, probe as net_probe};
pub use tcpping::{Prober, Sample, Target, TcpProber, ping_batch};
