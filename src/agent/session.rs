//! One session attempt: dial, authenticate, run the session tasks, tear down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::AgentState;
use crate::config::{Config, DEFAULT_METRICS_INTERVAL_MS};
use crate::overlay::{ConfigPatch, TcpPingSettings};
use crate::probe::{NetProbeResult, ping_batch};
use crate::protocol::{AGENT_VERSION, CAPABILITIES, Inbound, Outbound};
use crate::ws::{
    self, CLOSE_NORMAL, ConnectOptions, FrameReader, FrameWriter, MaybeTlsStream, Message,
};
use crate::{AgentError, Result};

type Reader = FrameReader<MaybeTlsStream>;
type Writer = FrameWriter<MaybeTlsStream>;

/// Upper bound for the best-effort close frame sent on shutdown.
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

/// How a session attempt ended.
pub(crate) struct SessionOutcome {
    /// `Ok` for a clean end (stop or reconnect request).
    pub(crate) result: Result<()>,
    /// Whether authentication completed and the session tasks ran.
    pub(crate) reached_active: bool,
}

impl SessionOutcome {
    fn new(result: Result<()>, reached_active: bool) -> Self {
        Self { result, reached_active }
    }
}

/// Run one attempt against the controller.
pub(crate) async fn run_once(
    state: Arc<AgentState>,
    net_probe: Option<&NetProbeResult>,
) -> SessionOutcome {
    // Static configuration is read once per attempt.
    let config = Arc::new(state.config.snapshot());
    let options = ConnectOptions {
        timeout: state.timings.dial,
        insecure_skip_verify: config.insecure_skip_verify,
    };

    info!(url = %config.master_ws_url, agent_id = %config.agent_id, "dialing controller");
    let connected = tokio::select! {
        _ = state.stop.cancelled() => return SessionOutcome::new(Ok(()), false),
        connected = ws::connect(&config.master_ws_url, &options) => connected,
    };
    let connection = match connected {
        Ok(connection) => connection,
        Err(e) => return SessionOutcome::new(Err(e), false),
    };

    let (reader, writer) = connection.into_split();
    let scope = state.stop.child_token();
    let session = Session { state, config, writer, scope };

    let outcome = session.drive(reader, net_probe).await;
    session.writer.close().await;
    outcome
}

/// Everything a session task needs. Cloned into each task.
#[derive(Clone)]
struct Session {
    state: Arc<AgentState>,
    config: Arc<Config>,
    writer: Writer,
    scope: CancellationToken,
}

impl Session {
    async fn drive(&self, reader: Reader, net_probe: Option<&NetProbeResult>) -> SessionOutcome {
        if let Err(e) = self.send_hello(net_probe).await {
            return SessionOutcome::new(Err(e), false);
        }

        let mut tasks = JoinSet::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        tasks.spawn(self.clone().receive(reader, ready_tx));

        // Authenticating
        let auth_timeout = self.state.timings.auth;
        let authenticated = tokio::select! {
            biased;
            _ = self.state.stop.cancelled() => None,
            ready = ready_rx => match ready {
                Ok(()) => Some(Ok(())),
                // The receive task ended before acknowledging; surface its error.
                Err(_) => match join_next(&mut tasks).await {
                    Ok(()) => None,
                    Err(e) => Some(Err(e)),
                },
            },
            _ = sleep(auth_timeout) => Some(Err(AgentError::timeout("authentication", auth_timeout))),
        };
        match authenticated {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                self.finish(tasks).await;
                return SessionOutcome::new(Err(e), false);
            }
            None => {
                self.goodbye().await;
                self.finish(tasks).await;
                return SessionOutcome::new(Ok(()), false);
            }
        }

        // Active
        info!(
            agent_id = %self.config.agent_id,
            config_version = self.state.overlay.config_version(),
            "authenticated, session active"
        );
        tasks.spawn(self.clone().watch_reconnect());
        tasks.spawn(self.clone().keepalive());
        tasks.spawn(self.clone().telemetry());
        tasks.spawn(self.clone().probe());

        let result = tokio::select! {
            biased;
            _ = self.state.stop.cancelled() => {
                self.goodbye().await;
                Ok(())
            }
            result = join_next(&mut tasks) => result,
        };

        // Draining
        self.finish(tasks).await;
        SessionOutcome::new(result, true)
    }

    /// Cancel the session scope and wait for every task to return.
    async fn finish(&self, mut tasks: JoinSet<Result<()>>) {
        self.scope.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "session task did not finish cleanly");
            }
        }
    }

    async fn goodbye(&self) {
        match timeout(GOODBYE_TIMEOUT, self.writer.send_close(CLOSE_NORMAL, "shutdown")).await {
            Ok(Ok(())) => debug!("close frame sent"),
            Ok(Err(e)) => debug!(error = %e, "failed to send close frame"),
            Err(_) => debug!("timed out sending close frame"),
        }
    }

    async fn send(&self, message: &Outbound<'_>) -> Result<()> {
        let payload = message.encode()?;
        trace!(kind = message.kind(), len = payload.len(), "sending message");
        self.writer.send_text(&payload).await
    }

    /// Send one sequenced message. A write that leaves the connection unusable
    /// ends the calling task; anything else only loses this message.
    async fn publish(&self, message: &Outbound<'_>, seq: u64) -> Result<()> {
        match self.send(message).await {
            Ok(()) => {
                debug!(kind = message.kind(), sequence = seq, "message sent");
                Ok(())
            }
            Err(e) if e.is_connection_fatal() => {
                warn!(kind = message.kind(), sequence = seq, error = %e, "send failed, ending session");
                Err(e)
            }
            Err(e) => {
                debug!(kind = message.kind(), sequence = seq, error = %e, "message dropped");
                Ok(())
            }
        }
    }

    async fn send_hello(&self, net_probe: Option<&NetProbeResult>) -> Result<()> {
        let config = &self.config;
        let hello = Outbound::Hello {
            agent_id: &config.agent_id,
            token: &config.token,
            agent_ver: AGENT_VERSION,
            client_ts: crate::unix_now(),
            cap: &CAPABILITIES,
            sys: &self.state.facts,
            alias: Some(config.alias.as_str()).filter(|alias| !alias.is_empty()),
            net_probe,
        };
        self.send(&hello).await
    }

    fn apply_config(&self, config: Option<ConfigPatch>, version: Option<i64>) {
        match config {
            Some(patch) => {
                self.state.overlay.apply(&patch, version);
            }
            None => trace!("message carried no configuration"),
        }
    }

    /// Read and dispatch controller messages until the connection fails or the
    /// controller ends the session.
    async fn receive(self, mut reader: Reader, ready: oneshot::Sender<()>) -> Result<()> {
        let deadline = self.state.timings.read;
        let mut ready = Some(ready);

        loop {
            let message = tokio::select! {
                _ = self.scope.cancelled() => return Ok(()),
                read = timeout(deadline, reader.read_message()) => {
                    read.map_err(|_| AgentError::timeout("read", deadline))??
                }
            };

            let payload = match message {
                Message::Text(payload) => payload,
                Message::Close(payload) => return Err(AgentError::ConnectionClosed { payload }),
                _ => {
                    trace!("ignoring non-text frame");
                    continue;
                }
            };
            let inbound = match Inbound::decode(&payload) {
                Ok(inbound) => inbound,
                Err(e) => {
                    debug!(error = %e, "ignoring unparsable message");
                    continue;
                }
            };

            match inbound {
                Inbound::HelloOk { config, config_version } => {
                    self.apply_config(config, config_version);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                }
                Inbound::ConfigPush { config, config_version } => {
                    self.apply_config(config, config_version);
                    let ack = Outbound::ConfigAck {
                        agent_id: &self.config.agent_id,
                        config_version: self.state.overlay.config_version(),
                        ok: true,
                        ts: crate::unix_now(),
                    };
                    if let Err(e) = self.send(&ack).await {
                        debug!(error = %e, "failed to send config_ack");
                    }
                }
                Inbound::AuthErr { message } => return Err(AgentError::AuthRejected { message }),
                Inbound::Kick { reason } => return Err(AgentError::Kicked { reason }),
                Inbound::Unknown { kind } => debug!(kind = %kind, "ignoring message"),
            }
        }
    }

    /// End the session cleanly when a reconnect is requested.
    async fn watch_reconnect(self) -> Result<()> {
        tokio::select! {
            _ = self.scope.cancelled() => return Ok(()),
            _ = self.state.reconnect.notified() => {}
        }
        info!("reconnect requested, closing session");
        if let Err(e) = self.writer.send_close(CLOSE_NORMAL, "reload").await {
            debug!(error = %e, "failed to send close frame");
        }
        self.writer.close().await;
        Ok(())
    }

    /// Ping on a fixed period. Write failures are left to the receive task.
    async fn keepalive(self) -> Result<()> {
        let period = self.state.timings.keepalive;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.scope.cancelled() => return Ok(()),
                _ = ticker.tick() => match self.writer.send_ping(b"ping").await {
                    Ok(()) => trace!("keepalive ping sent"),
                    Err(e) => debug!(error = %e, "keepalive ping failed"),
                },
            }
        }
    }

    async fn telemetry(self) -> Result<()> {
        let mut collector = (self.state.collectors)(&self.config);
        let default_ms = match self.config.metrics_interval_ms {
            0 => DEFAULT_METRICS_INTERVAL_MS,
            ms => ms,
        };

        loop {
            let period = self.state.overlay.metrics_interval(default_ms);
            tokio::select! {
                _ = self.scope.cancelled() => return Ok(()),
                _ = sleep(period) => {}
            }

            let snapshot = match collector.collect().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    debug!(error = %e, "skipping metrics cycle");
                    continue;
                }
            };
            let seq = self.state.sequence.advance();
            let message = Outbound::Metrics {
                agent_id: &self.config.agent_id,
                seq,
                ts: snapshot.ts,
                metrics: &snapshot,
            };
            self.publish(&message, seq).await?;
        }
    }

    /// Idle until TCP ping is active, then tick until its settings change.
    async fn probe(self) -> Result<()> {
        let mut changes = self.state.overlay.subscribe();
        loop {
            changes.borrow_and_update();
            let settings = self.state.overlay.tcpping(self.config.tcpping);
            if !settings.is_active() {
                trace!(enabled = settings.enabled, targets = settings.targets.len(), "tcp ping idle");
                tokio::select! {
                    _ = self.scope.cancelled() => return Ok(()),
                    _ = wait_for_change(&mut changes) => continue,
                }
            }
            if !self.ping_schedule(&settings, &mut changes).await? {
                return Ok(());
            }
        }
    }

    /// Returns `true` when the settings changed shape and `false` on cancellation.
    async fn ping_schedule(
        &self,
        settings: &TcpPingSettings,
        changes: &mut watch::Receiver<u64>,
    ) -> Result<bool> {
        let shape = settings.shape();
        info!(
            interval_sec = settings.interval.as_secs(),
            targets = settings.targets.len(),
            "tcp ping schedule started"
        );
        let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.scope.cancelled() => return Ok(false),
                _ = wait_for_change(changes) => {
                    if self.state.overlay.tcpping(self.config.tcpping).shape() != shape {
                        debug!("tcp ping settings changed, re-evaluating");
                        return Ok(true);
                    }
                }
                _ = ticker.tick() => {
                    // Targets may have been replaced without changing the shape.
                    let targets = self.state.overlay.tcpping(self.config.tcpping).targets;
                    let budget = self.state.timings.probe_batch;
                    let samples = tokio::select! {
                        _ = self.scope.cancelled() => return Ok(false),
                        samples = ping_batch(self.state.prober.as_ref(), &targets, budget) => samples,
                    };

                    let seq = self.state.sequence.advance();
                    let ok = samples.iter().filter(|sample| sample.ok).count();
                    trace!(sequence = seq, samples = samples.len(), ok, "tcp ping batch ready");
                    let message = Outbound::TcppingBatch {
                        agent_id: &self.config.agent_id,
                        seq,
                        ts: crate::unix_now(),
                        samples: &samples,
                    };
                    self.publish(&message, seq).await?;
                }
            }
        }
    }
}

/// Resolves on the next overlay change. Never resolves once the overlay is gone.
async fn wait_for_change(changes: &mut watch::Receiver<u64>) {
    if changes.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Result of the next task to finish. An empty set counts as a clean end.
async fn join_next(tasks: &mut JoinSet<Result<()>>) -> Result<()> {
    match tasks.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(e)) => Err(AgentError::io("session task", std::io::Error::other(e))),
        None => Ok(()),
    }
}
