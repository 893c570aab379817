//! Dialing a controller endpoint.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use super::codec::WsConnection;
use super::handshake::{Endpoint, upgrade};
use super::transport::{MaybeTlsStream, server_name, tls_connector};
use crate::{AgentError, Result};

/// Connection over a plain or TLS-wrapped TCP stream.
pub type Connection = WsConnection<MaybeTlsStream>;

/// Options for [`connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Deadline covering TCP connect, TLS handshake and upgrade.
    pub timeout: Duration,
    /// Accept any server certificate. Insecure; off by default.
    pub insecure_skip_verify: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), insecure_skip_verify: false }
    }
}

/// Dial `url` (`ws://` or `wss://`) and perform the upgrade handshake.
pub async fn connect(url: &str, options: &ConnectOptions) -> Result<Connection> {
    let endpoint = Endpoint::parse(url)?;
    tokio::time::timeout(options.timeout, dial(&endpoint, options.insecure_skip_verify))
        .await
        .map_err(|_| AgentError::timeout("dial", options.timeout))?
}

async fn dial(endpoint: &Endpoint, insecure_skip_verify: bool) -> Result<Connection> {
    debug!(host = %endpoint.host, port = endpoint.port, secure = endpoint.secure, "dialing");
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| AgentError::io("tcp connect", e))?;
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }

    let stream = if endpoint.secure {
        let connector = tls_connector(insecure_skip_verify)?;
        let name = server_name(&endpoint.host)?;
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|e| AgentError::tls("handshake failed", Box::new(e)))?;
        MaybeTlsStream::Tls(Box::new(tls))
    } else {
        MaybeTlsStream::Plain(tcp)
    };

    let connection = upgrade(stream, endpoint).await?;
    info!(host = %endpoint.host, port = endpoint.port, "connected to controller");
    Ok(connection)
}
