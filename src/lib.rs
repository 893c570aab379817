//! Host monitoring agent.
//!
//! Kokoro keeps one long-lived WebSocket session open to a controller and pushes
//! host metrics and TCP latency probes over it. The controller can retune the
//! agent at runtime by pushing configuration.
//!
//! # Features
//!
//! - **Self-contained WebSocket client**: frame codec and upgrade handshake over plain TCP or TLS
//! - **Resilient sessions**: exponential backoff, read deadlines, keepalive pings
//! - **Runtime configuration**: pushed settings layered over the static file
//! - **Ordered telemetry**: one process-wide sequence across reconnects
//!
//! # Layout
//!
//! - [`ws`]: RFC 6455 client (codec, handshake, transport)
//! - [`agent`]: session orchestration and the outer retry loop
//! - [`overlay`]: runtime configuration pushed by the controller
//! - [`config`]: static configuration file
//! - [`protocol`]: controller message set
//! - [`collector`] / [`collectors`]: host metrics
//! - [`probe`]: TCP ping and the one-time network probe
//!
//! ## Example
//!
//! ```rust,no_run
//! use kokoro::{Agent, Config, SharedConfig};
//!
//! #[tokio::main]
//! async fn main() -> kokoro::Result<()> {
//!     let (config, path) = Config::load(None)?;
//!     Agent::builder(SharedConfig::new(config, path)).build().run().await
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(test)]
mod test_utils;

// Wire protocol
pub mod protocol;
pub mod ws;

// Configuration
pub mod config;
pub mod overlay;

// Collaborators
pub mod collector;
pub mod collectors;
pub mod probe;

// Orchestration
pub mod agent;

pub use error::*;

pub use agent::{Agent, AgentBuilder, AgentHandle, SequenceCounter, Timings};
pub use collector::{MetricsCollector, MetricsSnapshot};
pub use config::{Config, SharedConfig};
pub use overlay::{ConfigPatch, RuntimeOverlay};

/// Current wall-clock time as Unix seconds.
pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
