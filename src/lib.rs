//! Edge Tunnel
//!
//! A WebSocket tunnel endpoint. Each inbound WebSocket carries one session:
//! the first binary frame is a handshake naming a credential and a
//! destination, after which bytes are relayed between the WebSocket and a
//! single outbound TCP connection. Supports TLS termination, a trusted peer
//! allowlist and a fallback egress address for unreachable destinations.

pub mod config;
pub mod credential;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod resolver;
pub mod security;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;

// Re-export commonly used types and functions
pub use config::{
    Config, DEFAULT_CONFIG_PATH, ListenConfig, TlsConfig, TunnelConfig, TunnelSettings,
    load_config, parse_config,
};
pub use credential::Credential;
pub use error::TunnelError;
pub use protocol::{
    Address, Command, DecodeError, EncodeError, HandshakeRequest, HandshakeResponse,
};
pub use proxy::handle_connection;
pub use relay::{BUFFER_SIZE, Connector, RelayOptions, TcpConnector};
pub use resolver::{Destination, FallbackPolicy};
pub use security::{PeerAllowlist, parse_original_client_ip};
pub use server::Server;
pub use session::{Session, SessionState};
pub use stream::InboundStream;
pub use tls::load_tls_acceptor;
