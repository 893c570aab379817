//! Error types for the monitoring agent.
//!
//! Every failure the agent can observe is expressed as an [`AgentError`]. Errors are
//! grouped into categories that decide how far they propagate:
//!
//! - **Transport**: dial, TLS and stream I/O failures
//! - **Protocol**: bad upgrade responses, oversized or fragmented frames
//! - **Authentication**: the controller rejected the credential
//! - **Liveness**: nothing arrived within the read deadline
//! - **Forced termination**: the controller kicked this agent
//! - **Local**: collector/prober failures, skipped for one cycle only
//! - **Configuration**: the static configuration could not be loaded
//!
//! Only configuration errors stop the process. Everything else ends at most the
//! current session attempt, and the outer loop backs off and redials.
//!
//! ```rust
//! use kokoro::{AgentError, ErrorCategory};
//!
//! let error = AgentError::handshake_failed("unexpected status 403");
//! assert_eq!(error.category(), ErrorCategory::Protocol);
//! assert!(error.is_retryable());
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for agent operations.
pub type Result<T, E = AgentError> = std::result::Result<T, E>;

/// Main error type for agent operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AgentError {
    #[error("I/O error during {operation}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("TLS setup failed: {reason}")]
    Tls {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("WebSocket handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("Frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("Fragmented frames are not supported")]
    Fragmented,

    #[error("Connection closed by peer")]
    ConnectionClosed { payload: Vec<u8> },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: &'static str, duration: Duration },

    #[error("Authentication rejected by controller{}", display_detail(.message))]
    AuthRejected { message: Option<String> },

    #[error("Kicked by controller{}", display_detail(.reason))]
    Kicked { reason: Option<String> },

    #[error("Message encoding failed")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("Metrics collection failed: {reason}")]
    Collector { reason: String },

    #[error("Configuration error in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("Configuration file error: {path}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn display_detail(detail: &Option<String>) -> String {
    match detail {
        Some(detail) if !detail.is_empty() => format!(": {detail}"),
        _ => String::new(),
    }
}

/// Coarse classification used for propagation and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Authentication,
    Liveness,
    ForcedTermination,
    Local,
    Configuration,
}

impl AgentError {
    /// Category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AgentError::Io { .. } => ErrorCategory::Transport,
            AgentError::InvalidUrl { .. } => ErrorCategory::Transport,
            AgentError::Tls { .. } => ErrorCategory::Transport,
            AgentError::ConnectionClosed { .. } => ErrorCategory::Transport,
            AgentError::Handshake { .. } => ErrorCategory::Protocol,
            AgentError::FrameTooLarge { .. } => ErrorCategory::Protocol,
            AgentError::Fragmented => ErrorCategory::Protocol,
            AgentError::Serialization { .. } => ErrorCategory::Protocol,
            AgentError::Timeout { .. } => ErrorCategory::Liveness,
            AgentError::AuthRejected { .. } => ErrorCategory::Authentication,
            AgentError::Kicked { .. } => ErrorCategory::ForcedTermination,
            AgentError::Collector { .. } => ErrorCategory::Local,
            AgentError::Config { .. } => ErrorCategory::Configuration,
            AgentError::ConfigFile { .. } => ErrorCategory::Configuration,
        }
    }

    /// Returns whether the outer session loop should redial after this error.
    ///
    /// Authentication failures are retried too: the credential may have been
    /// corrected through a reload in the meantime.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Configuration)
    }

    /// Returns whether this error invalidates the connection it was raised on.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Local | ErrorCategory::Configuration)
    }

    /// Helper constructor for I/O errors with operation context.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        AgentError::Io { operation, source }
    }

    /// Helper constructor for handshake failures.
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        AgentError::Handshake { reason: reason.into() }
    }

    /// Helper constructor for malformed endpoint URLs.
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentError::InvalidUrl { url: url.into(), reason: reason.into() }
    }

    /// Helper constructor for TLS errors with source.
    pub fn tls(reason: impl Into<String>, source: Box<dyn std::error::Error + Send + Sync>) -> Self {
        AgentError::Tls { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(operation: &'static str, duration: Duration) -> Self {
        AgentError::Timeout { operation, duration }
    }

    /// Helper constructor for invalid configuration.
    pub fn config_invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        AgentError::Config { path: path.into(), reason: reason.into() }
    }

    /// Helper constructor for collector failures.
    pub fn collector(reason: impl Into<String>) -> Self {
        AgentError::Collector { reason: reason.into() }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io { operation: "stream", source: err }
    }
}
