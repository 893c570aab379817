//! Minimal client side of the WebSocket protocol (RFC 6455).
//!
//! - `codec`: frame encoding, masking, and control-frame handling
//! - `handshake`: HTTP upgrade request and accept-key verification
//! - `transport`: plain/TLS stream and TLS configuration
//! - `client`: dialing with a connection-establishment deadline
//!
//! Only FIN-complete text, ping, pong and close frames are used. Compression
//! extensions and fragmentation are not supported.

mod client;
mod codec;
mod handshake;
mod transport;

pub use client::{ConnectOptions, Connection, connect};
pub use codec::{
    CLOSE_NORMAL, FrameReader, FrameWriter, MAX_FRAME_SIZE, Message, Opcode, WsConnection,
    apply_mask, close_payload, encode_frame,
};
pub use handshake::{
    Endpoint, UpgradeResponse, WEBSOCKET_GUID, build_request, compute_accept_key, generate_key,
    read_response, upgrade,
};
pub use transport::MaybeTlsStream;
