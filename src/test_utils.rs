//! Test utilities: an in-process controller and deterministic collaborators
//!
//! [`MockController`] listens on loopback, answers the upgrade handshake, and
//! then speaks unmasked server frames while checking that every client frame is
//! masked.

#![cfg(test)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::{AgentError, Result};
use crate::collector::{MetricsCollector, MetricsSnapshot};
use crate::config::{Config, TcpPingDefaults};
use crate::probe::{Prober, Sample, Target};
use crate::protocol::SystemFacts;
use crate::ws::{Opcode, apply_mask, close_payload, compute_accept_key, encode_frame};

/// Default wait for anything the controller expects from the agent.
pub const WAIT: Duration = Duration::from_secs(5);

/// Loopback controller endpoint.
pub struct MockController {
    listener: TcpListener,
    url: String,
}

impl MockController {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/agent", listener.local_addr().unwrap());
        Self { listener, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Accept one agent and complete the upgrade.
    pub async fn accept(&self) -> ControllerConn {
        let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("agent did not dial in time")
            .unwrap();
        let (read, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read);

        let mut request = String::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "agent closed during upgrade");
            if line == "\r\n" {
                break;
            }
            request.push_str(&line);
        }
        let key = request
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim().eq_ignore_ascii_case("sec-websocket-key").then(|| value.trim())
            })
            .expect("upgrade request without key")
            .to_owned();

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            compute_accept_key(&key)
        );
        writer.write_all(response.as_bytes()).await.unwrap();
        ControllerConn { reader, writer, request }
    }
}

/// Server side of one accepted agent connection.
pub struct ControllerConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Upgrade request head as received.
    pub request: String,
}

impl ControllerConn {
    /// Read one client frame, asserting it is masked and FIN-complete.
    pub async fn read_frame(&mut self) -> std::io::Result<(Opcode, Vec<u8>)> {
        let mut head = [0u8; 2];
        self.reader.read_exact(&mut head).await?;
        assert_eq!(head[0] & 0x80, 0x80, "client frame without FIN");
        assert_eq!(head[1] & 0x80, 0x80, "client frame without mask");

        let len = match head[1] & 0x7f {
            126 => u64::from(self.reader.read_u16().await?),
            127 => self.reader.read_u64().await?,
            n => u64::from(n),
        };
        let mut key = [0u8; 4];
        self.reader.read_exact(&mut key).await?;
        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload).await?;
        apply_mask(&mut payload, key);
        Ok((Opcode::from_bits(head[0]), payload))
    }

    /// Next text message as JSON, skipping control frames.
    pub async fn recv_json(&mut self) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                let (opcode, payload) = self.read_frame().await.expect("connection ended");
                if opcode == Opcode::Text {
                    return serde_json::from_slice(&payload).expect("agent sent invalid JSON");
                }
            }
        })
        .await
        .expect("no message from agent")
    }

    /// Next message of the given `type`, skipping others.
    pub async fn recv_type(&mut self, kind: &str, within: Duration) -> Value {
        tokio::time::timeout(within, async {
            loop {
                let message = self.recv_json().await;
                if message["type"] == kind {
                    return message;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {kind} message within {within:?}"))
    }

    /// Wait for the next close frame or EOF. Returns the close payload if any.
    pub async fn recv_close(&mut self) -> Option<Vec<u8>> {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.read_frame().await {
                    Ok((Opcode::Close, payload)) => return Some(payload),
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
        })
        .await
        .expect("connection stayed open")
    }

    pub async fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) {
        self.writer.write_all(&encode_frame(opcode, payload, None)).await.unwrap();
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_frame(Opcode::Text, value.to_string().as_bytes()).await;
    }

    pub async fn send_close(&mut self, code: u16, reason: &str) {
        self.send_frame(Opcode::Close, &close_payload(code, reason)).await;
    }
}

/// Valid configuration pointing at `url`.
pub fn test_config(url: &str) -> Config {
    Config {
        master_ws_url: url.to_owned(),
        token: "test-token".to_owned(),
        agent_id: "agent-test".to_owned(),
        metrics_interval_ms: 50,
        net_iface: "auto".to_owned(),
        tcpping: TcpPingDefaults::default(),
        ..Default::default()
    }
}

pub fn test_facts() -> SystemFacts {
    SystemFacts { hostname: "test-host".into(), os: "linux".into(), arch: "x86_64".into() }
}

/// Collector returning the same figures on every call.
pub struct StaticCollector;

#[async_trait::async_trait]
impl MetricsCollector for StaticCollector {
    async fn collect(&mut self) -> Result<MetricsSnapshot> {
        Ok(MetricsSnapshot { ts: crate::unix_now(), cpu: 12.5, mem: 40.0, ..Default::default() })
    }
}

/// Collector that fails on odd calls, counting every call in `calls`.
pub struct FlakyCollector {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl MetricsCollector for FlakyCollector {
    async fn collect(&mut self) -> Result<MetricsSnapshot> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call % 2 == 1 {
            return Err(AgentError::collector("counters unavailable"));
        }
        Ok(MetricsSnapshot { ts: crate::unix_now(), cpu: 7.5, ..Default::default() })
    }
}

/// Prober reporting every target reachable after 1 ms.
pub struct InstantProber;

#[async_trait::async_trait]
impl Prober for InstantProber {
    async fn ping(&self, target: &Target, _timeout: Duration) -> Sample {
        Sample {
            host: target.host.clone(),
            port: target.port,
            ok: true,
            rtt_ms: Some(1),
            ..Default::default()
        }
    }
}

pub fn instant_prober() -> Arc<dyn Prober> {
    Arc::new(InstantProber)
}
