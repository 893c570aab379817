//! HTTP upgrade handshake (RFC 6455 section 4).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;
use url::{Host, Url};

use super::codec::WsConnection;
use crate::{AgentError, Result};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the size of the upgrade response head.
const MAX_RESPONSE_HEAD: u64 = 16 * 1024;

const USER_AGENT: &str = concat!("kokoro-agent/", env!("CARGO_PKG_VERSION"));

/// Parsed controller endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `wss://` endpoints are wrapped in TLS.
    pub secure: bool,
    /// Host without IPv6 brackets, suitable for DNS resolution and SNI.
    pub host: String,
    pub port: u16,
    /// Path plus query, never empty.
    pub resource: String,
    /// Value of the `Host` request header.
    pub host_header: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| AgentError::invalid_url(raw, e.to_string()))?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(AgentError::invalid_url(raw, format!("unsupported scheme: {other}")));
            }
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_owned(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(AgentError::invalid_url(raw, "missing host")),
        };
        let port = url.port_or_known_default().unwrap_or(if secure { 443 } else { 80 });

        let mut resource = url.path().to_owned();
        if resource.is_empty() {
            resource.push('/');
        }
        if let Some(query) = url.query() {
            resource.push('?');
            resource.push_str(query);
        }

        let host_str = url.host_str().unwrap_or(&host);
        let host_header = match url.port() {
            Some(explicit) => format!("{host_str}:{explicit}"),
            None => host_str.to_owned(),
        };

        Ok(Self { secure, host, port, resource, host_header })
    }
}

/// Generate a fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    BASE64.encode(rand::random::<[u8; 16]>())
}

/// Expected `Sec-WebSocket-Accept` value for `key`.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Render the upgrade request for `endpoint`.
pub fn build_request(endpoint: &Endpoint, key: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         User-Agent: {}\r\n\
         \r\n",
        endpoint.resource, endpoint.host_header, key, USER_AGENT
    )
}

/// Status line and headers of the upgrade response.
#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl UpgradeResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Check the status and accept key against the key we sent.
    pub fn verify(&self, key: &str) -> Result<()> {
        if self.status != 101 {
            return Err(AgentError::handshake_failed(format!("unexpected status {}", self.status)));
        }
        let accept = self
            .header("Sec-WebSocket-Accept")
            .ok_or_else(|| AgentError::handshake_failed("missing Sec-WebSocket-Accept"))?;
        if accept != compute_accept_key(key) {
            return Err(AgentError::handshake_failed("Sec-WebSocket-Accept mismatch"));
        }
        Ok(())
    }
}

/// Read the response head, leaving anything after the blank line buffered.
pub async fn read_response<R>(reader: &mut BufReader<R>) -> Result<UpgradeResponse>
where
    R: AsyncRead + Unpin,
{
    let mut budget = MAX_RESPONSE_HEAD;
    let status_line = read_head_line(reader, &mut budget).await?;

    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(AgentError::handshake_failed(format!("malformed status line: {status_line}")));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| AgentError::handshake_failed(format!("malformed status line: {status_line}")))?;

    let mut headers = Vec::new();
    loop {
        let line = read_head_line(reader, &mut budget).await?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| AgentError::handshake_failed(format!("malformed header: {line}")))?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }

    Ok(UpgradeResponse { status, headers })
}

async fn read_head_line<R>(reader: &mut BufReader<R>, budget: &mut u64) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = (&mut *reader)
        .take(*budget)
        .read_line(&mut line)
        .await
        .map_err(|e| AgentError::io("handshake read", e))?;
    if read == 0 || !line.ends_with('\n') {
        return Err(AgentError::handshake_failed("truncated upgrade response"));
    }
    *budget -= read as u64;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

/// Upgrade an established stream. On failure the stream is shut down.
///
/// The buffered reader used for the response head is kept for frame reads so
/// bytes the controller sent right after the head are not lost.
pub async fn upgrade<S>(stream: S, endpoint: &Endpoint) -> Result<WsConnection<S>>
where
    S: AsyncRead + AsyncWrite,
{
    let key = generate_key();
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let outcome = async {
        let request = build_request(endpoint, &key);
        write_half
            .write_all(request.as_bytes())
            .await
            .map_err(|e| AgentError::io("handshake write", e))?;
        write_half.flush().await.map_err(|e| AgentError::io("handshake write", e))?;
        read_response(&mut reader).await?.verify(&key)
    }
    .await;

    match outcome {
        Ok(()) => {
            debug!(host = %endpoint.host, resource = %endpoint.resource, "websocket upgraded");
            Ok(WsConnection::from_parts(reader, write_half))
        }
        Err(e) => {
            let _ = write_half.shutdown().await;
            Err(e)
        }
    }
}
