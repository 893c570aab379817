//! Session orchestration.
//!
//! [`Agent::run`] drives the outer loop: dial the controller, authenticate with
//! `hello`, run the session tasks until the connection ends, then back off and
//! redial. Each attempt moves through `Dialing → Authenticating → Active →
//! Closed`; only the [`RuntimeOverlay`] and the [`SequenceCounter`] survive from
//! one attempt to the next.
//!
//! While a session is active these tasks share its connection:
//!
//! - **receive**: reads frames under a sliding deadline and dispatches controller messages
//! - **reconnect watcher**: closes the session when [`AgentHandle::request_reconnect`] fires
//! - **keepalive**: pings on a fixed period
//! - **telemetry**: collects and sends one metrics snapshot per cycle
//! - **probe**: sends one TCP-ping batch per tick while ping is enabled
//!
//! The first task to finish cancels the session scope, and all of them are
//! joined before the next dial.
//!
//! ```rust,no_run
//! use kokoro::agent::Agent;
//! use kokoro::config::{Config, SharedConfig};
//!
//! # async fn example() -> kokoro::Result<()> {
//! let (config, path) = Config::load(None)?;
//! let agent = Agent::builder(SharedConfig::new(config, path)).build();
//! let handle = agent.handle();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.stop();
//! });
//! agent.run().await
//! # }
//! ```

mod backoff;
mod session;


use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use backoff::Backoff;

use crate::{AgentError, Result};
use crate::collector::MetricsCollector;
use crate::collectors::SystemCollector;
use crate::config::{Config, SharedConfig};
use crate::overlay::RuntimeOverlay;
use crate::probe::{NetProbeResult, Prober, TcpProber, netprobe};
use crate::protocol::SystemFacts;

/// Builds a fresh collector for each session from that session's configuration.
pub type CollectorFactory = Arc<dyn Fn(&Config) -> Box<dyn MetricsCollector> + Send + Sync>;

/// Timeouts and periods used by the orchestrator.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Connection establishment, including TLS and the upgrade.
    pub dial: Duration,
    /// Wait for `hello_ok` after sending `hello`.
    pub auth: Duration,
    /// Sliding deadline for each frame read.
    pub read: Duration,
    pub keepalive: Duration,
    /// Upper bound for one TCP-ping batch.
    pub probe_batch: Duration,
    pub net_probe: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(10),
            auth: Duration::from_secs(10),
            read: Duration::from_secs(90),
            keepalive: Duration::from_secs(30),
            probe_batch: Duration::from_secs(4),
            net_probe: netprobe::DEFAULT_NET_PROBE_TIMEOUT,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Process-wide sequence stamped on every metrics and probe-batch message.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    /// Next value; the first call returns 1.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last value handed out.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// State shared by the outer loop, the session tasks and every handle.
pub(crate) struct AgentState {
    pub(crate) config: Arc<SharedConfig>,
    pub(crate) overlay: Arc<RuntimeOverlay>,
    pub(crate) sequence: SequenceCounter,
    pub(crate) timings: Timings,
    pub(crate) collectors: CollectorFactory,
    pub(crate) prober: Arc<dyn Prober>,
    pub(crate) facts: SystemFacts,
    pub(crate) reconnect: Notify,
    pub(crate) stop: CancellationToken,
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    config: Arc<SharedConfig>,
    timings: Timings,
    collectors: Option<CollectorFactory>,
    prober: Option<Arc<dyn Prober>>,
    facts: Option<SystemFacts>,
    net_probe: NetProbe,
}

/// Where the `hello` network probe result comes from.
enum NetProbe {
    Run,
    Skip,
    Known(NetProbeResult),
}

impl AgentBuilder {
    pub fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Replace the default [`SystemCollector`].
    pub fn collector_factory(mut self, factory: CollectorFactory) -> Self {
        self.collectors = Some(factory);
        self
    }

    /// Replace the default [`TcpProber`].
    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn system_facts(mut self, facts: SystemFacts) -> Self {
        self.facts = Some(facts);
        self
    }

    /// Run the one-time network probe before the first dial (on by default).
    pub fn net_probe(mut self, enabled: bool) -> Self {
        self.net_probe = if enabled { NetProbe::Run } else { NetProbe::Skip };
        self
    }

    /// Announce a result captured earlier instead of probing.
    pub fn net_probe_result(mut self, result: NetProbeResult) -> Self {
        self.net_probe = NetProbe::Known(result);
        self
    }

    pub fn build(self) -> Agent {
        let collectors: CollectorFactory = match self.collectors {
            Some(factory) => factory,
            None => Arc::new(|config: &Config| -> Box<dyn MetricsCollector> {
                Box::new(SystemCollector::new(&config.net_iface))
            }),
        };
        let prober: Arc<dyn Prober> = match self.prober {
            Some(prober) => prober,
            None => Arc::new(TcpProber),
        };
        let state = AgentState {
            config: self.config,
            overlay: Arc::new(RuntimeOverlay::new()),
            sequence: SequenceCounter::default(),
            timings: self.timings,
            collectors,
            prober,
            facts: self.facts.unwrap_or_else(SystemFacts::detect),
            reconnect: Notify::new(),
            stop: CancellationToken::new(),
        };
        Agent { state: Arc::new(state), net_probe: self.net_probe }
    }
}

/// The monitoring agent.
pub struct Agent {
    state: Arc<AgentState>,
    net_probe: NetProbe,
}

impl Agent {
    pub fn builder(config: SharedConfig) -> AgentBuilder {
        AgentBuilder {
            config: Arc::new(config),
            timings: Timings::default(),
            collectors: None,
            prober: None,
            facts: None,
            net_probe: NetProbe::Run,
        }
    }

    /// Handle for stop, reconnect and reload requests from other tasks.
    pub fn handle(&self) -> AgentHandle {
        AgentHandle { state: Arc::clone(&self.state) }
    }

    pub fn overlay(&self) -> Arc<RuntimeOverlay> {
        Arc::clone(&self.state.overlay)
    }

    /// Run sessions until [`AgentHandle::stop`] is called.
    ///
    /// Session failures are logged and retried with backoff. Only an error that
    /// is not retryable ends the loop with `Err`.
    pub async fn run(self) -> Result<()> {
        let state = self.state;
        let net_probe = match self.net_probe {
            NetProbe::Run => Self::probe_network(&state).await,
            NetProbe::Skip => None,
            NetProbe::Known(result) => Some(result),
        };

        let mut backoff = Backoff::new(state.timings.backoff_initial, state.timings.backoff_max);
        let mut attempt = 0u64;

        while !state.stop.is_cancelled() {
            attempt += 1;
            let outcome = session::run_once(Arc::clone(&state), net_probe.as_ref()).await;

            let error = match outcome.result {
                Ok(()) => {
                    backoff.reset();
                    continue;
                }
                Err(error) => error,
            };
            if !error.is_retryable() {
                return Err(error);
            }
            if outcome.reached_active {
                backoff.reset();
            }

            let delay = backoff.next_delay();
            warn!(
                attempt,
                error = %error,
                category = ?error.category(),
                backoff_ms = delay.as_millis() as u64,
                "session ended, redialing after backoff"
            );

            tokio::select! {
                _ = state.stop.cancelled() => break,
                _ = state.reconnect.notified() => {
                    info!("reconnect requested during backoff, redialing now");
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(sequence = state.sequence.current(), "agent stopped");
        Ok(())
    }

    async fn probe_network(state: &AgentState) -> Option<NetProbeResult> {
        let insecure = state.config.snapshot().insecure_skip_verify;
        tokio::select! {
            _ = state.stop.cancelled() => None,
            result = netprobe::probe(state.timings.net_probe, insecure) => Some(result),
        }
    }
}

/// Cloneable control surface for a running [`Agent`].
#[derive(Clone)]
pub struct AgentHandle {
    state: Arc<AgentState>,
}

impl AgentHandle {
    /// Ask the active session to close so the next one picks up fresh static
    /// configuration. Requests made before the session consumes one coalesce.
    pub fn request_reconnect(&self) {
        self.state.reconnect.notify_one();
    }

    /// Stop the agent. Idempotent.
    pub fn stop(&self) {
        self.state.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stop.is_cancelled()
    }

    /// Re-read the configuration file and, on success, reconnect. On failure
    /// the current session keeps running with the previous configuration.
    pub fn reload_config(&self) -> Result<()> {
        self.state.config.reload()?;
        self.request_reconnect();
        Ok(())
    }

    /// [`reload_config`](Self::reload_config) on the blocking pool, for callers
    /// running on the async runtime.
    pub async fn reload(&self) -> Result<()> {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || handle.reload_config())
            .await
            .map_err(|e| AgentError::io("config reload", std::io::Error::other(e)))?
    }

    pub fn overlay(&self) -> Arc<RuntimeOverlay> {
        Arc::clone(&self.state.overlay)
    }

    pub fn sequence(&self) -> u64 {
        self.state.sequence.current()
    }
}
