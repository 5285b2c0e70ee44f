//! Session error kinds.
//!
//! Every variant ends the session it occurred in and nothing else. The remote
//! caller only ever observes the close frame; the variant and its context go
//! to the operator log.

use std::{io, time::Duration};
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::protocol::{Command, DecodeError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed handshake: {0}")]
    Decode(#[from] DecodeError),

    #[error("authentication failed: credential mismatch")]
    Auth,

    #[error("unsupported operation: {0}")]
    Unsupported(Command),

    #[error("failed to connect to {destination}: {source}")]
    Connect {
        destination: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Stream {
        context: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("no traffic for {0:?}")]
    IdleTimeout(Duration),
}

impl TunnelError {
    pub fn stream(context: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Stream {
            context,
            source: source.into(),
        }
    }

    /// Stable label for the `kind` log field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Auth => "auth",
            Self::Unsupported(_) => "unsupported",
            Self::Connect { .. } => "connect",
            Self::Stream { .. } => "stream",
            Self::IdleTimeout(_) => "timeout",
        }
    }

    /// Close code sent to the caller when this error ends a session.
    ///
    /// Rejected handshakes look like an ordinary close; failures on our side
    /// of the tunnel are reported as an internal error.
    #[must_use]
    pub const fn close_code(&self) -> CloseCode {
        match self {
            Self::Decode(_) | Self::Auth | Self::Unsupported(_) => CloseCode::Normal,
            Self::Connect { .. } | Self::Stream { .. } | Self::IdleTimeout(_) => CloseCode::Error,
        }
    }
}
