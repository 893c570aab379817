//! Controller message set.
//!
//! Every message is a JSON object in one text frame, discriminated by its `type`
//! field. Outbound messages serialize through [`Outbound`]; inbound messages are
//! decoded tag first into [`Inbound`], and unrecognized tags become
//! [`Inbound::Unknown`] rather than an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::Result;
use crate::collector::MetricsSnapshot;
use crate::overlay::ConfigPatch;
use crate::probe::{NetProbeResult, Sample};

/// Capabilities announced in `hello`.
pub const CAPABILITIES: [&str; 2] = ["metrics", "tcpping"];

/// Version string announced in `hello`.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Static facts about the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFacts {
    pub hostname: String,
    pub os: String,
    pub arch: String,
}

impl SystemFacts {
    pub fn detect() -> Self {
        Self {
            hostname: sysinfo::System::host_name()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "unknown".to_owned()),
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
        }
    }
}

/// Messages sent to the controller.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound<'a> {
    Hello {
        agent_id: &'a str,
        token: &'a str,
        agent_ver: &'a str,
        client_ts: i64,
        cap: &'a [&'a str],
        sys: &'a SystemFacts,
        #[serde(skip_serializing_if = "Option::is_none")]
        alias: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        net_probe: Option<&'a NetProbeResult>,
    },
    Metrics {
        agent_id: &'a str,
        seq: u64,
        ts: i64,
        metrics: &'a MetricsSnapshot,
    },
    TcppingBatch {
        agent_id: &'a str,
        seq: u64,
        ts: i64,
        samples: &'a [Sample],
    },
    ConfigAck {
        agent_id: &'a str,
        config_version: i64,
        ok: bool,
        ts: i64,
    },
}

impl Outbound<'_> {
    /// Serialize to the payload of one text frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Hello { .. } => "hello",
            Outbound::Metrics { .. } => "metrics",
            Outbound::TcppingBatch { .. } => "tcpping_batch",
            Outbound::ConfigAck { .. } => "config_ack",
        }
    }
}

/// Messages received from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// `hello_ok` or `hello_ack`.
    HelloOk { config: Option<ConfigPatch>, config_version: Option<i64> },
    ConfigPush { config: Option<ConfigPatch>, config_version: Option<i64> },
    AuthErr { message: Option<String> },
    Kick { reason: Option<String> },
    Unknown { kind: String },
}

impl Inbound {
    /// Decode one text payload. Fails only when the payload is not valid JSON.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();

        Ok(match kind {
            "hello_ok" | "hello_ack" => Inbound::HelloOk {
                config: embedded_config(&value),
                config_version: config_version(&value),
            },
            "config_push" => Inbound::ConfigPush {
                config: embedded_config(&value),
                config_version: config_version(&value),
            },
            "auth_err" => Inbound::AuthErr { message: text_field(&value, &["message", "reason"]) },
            "kick" => Inbound::Kick { reason: text_field(&value, &["reason", "message"]) },
            other => Inbound::Unknown { kind: other.to_owned() },
        })
    }
}

/// A `config` object that does not decode is treated as absent.
fn embedded_config(value: &Value) -> Option<ConfigPatch> {
    let raw = value.get("config").filter(|raw| !raw.is_null())?;
    ConfigPatch::deserialize(raw)
        .map_err(|e| debug!(error = %e, "ignoring malformed embedded config"))
        .ok()
}

fn config_version(value: &Value) -> Option<i64> {
    let raw = value.get("config_version")?;
    raw.as_i64().or_else(|| raw.as_f64().map(|v| v as i64))
}

fn text_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| value.get(*key).and_then(Value::as_str)).map(str::to_owned)
}
