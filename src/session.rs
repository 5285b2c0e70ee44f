//! Per-connection state machine.
//!
//! A session reads exactly one handshake from the inbound stream, dials the
//! destination it names and then relays until either side goes away:
//!
//! ```text
//! AwaitingHandshake ──▶ Relaying ──▶ Closed
//!         │                            ▲
//!         └────────────────────────────┘  (any handshake failure)
//! ```

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio_tungstenite::tungstenite::{
    Error as WsError, Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tracing::{debug, info, trace, warn};

use crate::config::TunnelSettings;
use crate::error::TunnelError;
use crate::protocol;
use crate::relay::{self, Connector};
use crate::resolver::{self, Destination};

/// Upper bound on delivering the close frame to a caller that stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    AwaitingHandshake,
    Relaying,
    Closed,
}

pub struct Session<C> {
    settings: Arc<TunnelSettings>,
    connector: C,
    state: SessionState,
}

impl<C: Connector> Session<C> {
    pub fn new(settings: Arc<TunnelSettings>, connector: C) -> Self {
        Self {
            settings,
            connector,
            state: SessionState::AwaitingHandshake,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session over `inbound` to completion.
    ///
    /// A close frame is always offered to the inbound stream before this
    /// returns, whatever the outcome. If the caller does not take it within
    /// the idle timeout (capped at five seconds) the stream is dropped
    /// instead. The returned error is for the operator log only.
    #[tracing::instrument(skip_all)]
    pub async fn run<S>(&mut self, inbound: S) -> Result<(), TunnelError>
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    {
        let (mut sink, mut stream) = inbound.split();

        let result = self.drive(&mut sink, &mut stream).await;
        self.close(&mut sink, result.as_ref().err()).await;
        result
    }

    async fn drive<K, R>(&mut self, sink: &mut K, stream: &mut R) -> Result<(), TunnelError>
    where
        K: Sink<Message, Error = WsError> + Unpin,
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let Some(frame) = next_handshake_frame(stream, self.settings.relay.idle_timeout).await?
        else {
            debug!("Inbound stream closed before handshake");
            return Ok(());
        };

        let request = protocol::decode(frame)?;
        self.settings.credential.verify(&request.credential)?;
        let destination = resolver::resolve(&request, &self.settings.fallback)?;
        info!(
            command = %request.command,
            requested = %request.address,
            target_addr = %destination,
            "Handshake accepted"
        );

        let mut early = BytesMut::new();
        let Some(outbound) = self.connect_watching(&destination, stream, &mut early).await? else {
            debug!(target_addr = %destination, "Caller left while connecting");
            return Ok(());
        };
        self.transition(SessionState::Relaying);

        let first_payload = if early.is_empty() {
            request.payload
        } else {
            let mut joined = BytesMut::with_capacity(request.payload.len() + early.len());
            joined.extend_from_slice(&request.payload);
            joined.extend_from_slice(&early);
            joined.freeze()
        };

        relay::run(
            outbound,
            sink,
            stream,
            first_payload,
            &self.settings.relay,
        )
        .await
    }

    /// Dials `destination` while still reading the inbound stream.
    ///
    /// Data frames that arrive meanwhile are appended to `early` so they
    /// reach the destination after the handshake payload, in order. At most
    /// `queue_depth` frames are held; past that the inbound stream is left
    /// unread until the connect finishes. `None` means the caller left first.
    async fn connect_watching<R>(
        &self,
        destination: &Destination,
        stream: &mut R,
        early: &mut BytesMut,
    ) -> Result<Option<C::Stream>, TunnelError>
    where
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let connect = relay::connect(&self.connector, destination, self.settings.connect_timeout);
        tokio::pin!(connect);
        let mut held = 0;

        loop {
            tokio::select! {
                result = &mut connect => return result.map(Some),
                msg = stream.next(), if held < self.settings.relay.queue_depth => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        early.extend_from_slice(&data);
                        held += 1;
                    }
                    Some(Ok(Message::Text(text))) => {
                        early.extend_from_slice(text.as_bytes());
                        held += 1;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Err(e)) if relay::is_disconnect(&e) => return Ok(None),
                    Some(Err(e)) => {
                        return Err(TunnelError::stream("failed to read inbound stream", e));
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn close<K>(&mut self, sink: &mut K, failure: Option<&TunnelError>)
    where
        K: Sink<Message, Error = WsError> + Unpin,
    {
        if self.state == SessionState::Closed {
            return;
        }
        self.transition(SessionState::Closed);

        let frame = match failure {
            Some(err) => CloseFrame {
                code: err.close_code(),
                reason: err.kind().into(),
            },
            None => CloseFrame {
                code: CloseCode::Normal,
                reason: "close".into(),
            },
        };
        let limit = self
            .settings
            .relay
            .idle_timeout
            .map_or(CLOSE_TIMEOUT, |idle| idle.min(CLOSE_TIMEOUT));
        let closing = async {
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                trace!(error = %e, "Inbound stream already closed");
            }
            if let Err(e) = sink.close().await {
                trace!(error = %e, "Ignoring error while closing inbound stream");
            }
        };
        if tokio::time::timeout(limit, closing).await.is_err() {
            debug!(?limit, "Caller did not take the close frame, dropping the stream");
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "{:?} -> {next:?}", self.state);
        debug!(from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }
}

/// Waits for the first binary frame. `None` means the caller went away first.
async fn next_handshake_frame<R>(
    stream: &mut R,
    limit: Option<Duration>,
) -> Result<Option<Bytes>, TunnelError>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let wait = async {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => return Ok(Some(data)),
                Ok(Message::Text(_)) => warn!("Dropping text message (binary only)"),
                Ok(Message::Close(_)) => return Ok(None),
                Err(e) if relay::is_disconnect(&e) => return Ok(None),
                Err(e) => return Err(TunnelError::stream("failed to read handshake", e)),
                Ok(_) => {}
            }
        }
        Ok(None)
    };

    match limit {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .unwrap_or_else(|_| Err(TunnelError::IdleTimeout(limit))),
        None => wait.await,
    }
}
