//! TCP connect latency probes.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::trace;

/// Per-target timeout when the target does not set one.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(1500);

/// One probe destination, as pushed by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub province: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub carrier: String,
    /// 4 or 6 to force an address family, 0 for any.
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub ip_ver: u8,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub timeout_ms: u64,
}

impl Target {
    /// Effective timeout: the target's own, else the default, never above `cap`.
    pub fn timeout(&self, cap: Duration) -> Duration {
        let own = if self.timeout_ms > 0 {
            Duration::from_millis(self.timeout_ms)
        } else {
            DEFAULT_PING_TIMEOUT
        };
        own.min(cap)
    }

    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self.ip_ver {
            4 => addr.is_ipv4(),
            6 => addr.is_ipv6(),
            _ => true,
        }
    }
}

/// Result of probing one [`Target`]. Echoes the target's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub province: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub carrier: String,
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub ip_ver: u8,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,

    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Sample {
    fn for_target(target: &Target) -> Self {
        Self {
            id: target.id.clone(),
            province: target.province.clone(),
            carrier: target.carrier.clone(),
            ip_ver: target.ip_ver,
            host: target.host.clone(),
            port: target.port,
            label: target.label.clone(),
            ..Default::default()
        }
    }

    fn failed(mut self, tag: &str) -> Self {
        self.ok = false;
        self.err = Some(tag.to_owned());
        self
    }
}

fn is_zero_u8(value: &u8) -> bool {
    *value == 0
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

/// Latency prober. Implementations never fail; errors are reported in the sample.
#[async_trait::async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn ping(&self, target: &Target, timeout: Duration) -> Sample;
}

/// Measures the time to complete a TCP handshake with the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait::async_trait]
impl Prober for TcpProber {
    async fn ping(&self, target: &Target, timeout: Duration) -> Sample {
        let sample = Sample::for_target(target);
        match tokio::time::timeout(timeout, connect(target)).await {
            Ok(Ok(rtt)) => {
                let rtt_ms = rtt.as_millis() as u64;
                trace!(host = %target.host, port = target.port, rtt_ms, "tcp ping ok");
                Sample { ok: true, rtt_ms: Some(rtt_ms), ..sample }
            }
            Ok(Err(tag)) => sample.failed(tag),
            Err(_) => sample.failed("timeout"),
        }
    }
}

async fn connect(target: &Target) -> Result<Duration, &'static str> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|_| "resolve")?
        .filter(|addr| target.accepts(addr))
        .collect();
    if addrs.is_empty() {
        return Err("resolve");
    }

    let mut last = "error";
    for addr in addrs {
        let start = Instant::now();
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let rtt = start.elapsed();
                drop(stream);
                return Ok(rtt);
            }
            Err(e) => last = classify(&e),
        }
    }
    Err(last)
}

/// Short error tag for a failed connect.
pub fn classify(error: &io::Error) -> &'static str {
    match error.kind() {
        io::ErrorKind::TimedOut => "timeout",
        io::ErrorKind::ConnectionRefused => "refused",
        io::ErrorKind::HostUnreachable => "noroute",
        io::ErrorKind::NetworkUnreachable => "unreach",
        _ => {
            let message = error.to_string().to_ascii_lowercase();
            if message.contains("too many open files") {
                "fdlimit"
            } else if message.contains("no route") {
                "noroute"
            } else if message.contains("unreachable") {
                "unreach"
            } else {
                "error"
            }
        }
    }
}

/// Probe every target concurrently. Samples keep the order of `targets`; no
/// probe runs longer than `budget`.
pub async fn ping_batch(prober: &dyn Prober, targets: &[Target], budget: Duration) -> Vec<Sample> {
    join_all(targets.iter().map(|target| prober.ping(target, target.timeout(budget)))).await
}
