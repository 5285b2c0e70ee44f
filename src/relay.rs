use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::{
    future::Future,
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::Instant,
};
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use tracing::{debug, info};

use crate::error::TunnelError;
use crate::protocol::HandshakeResponse;
use crate::resolver::Destination;

pub const BUFFER_SIZE: usize = 8192;

/// Opens the outbound side of a session.
pub trait Connector {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn connect(&self, host: &str, port: u16)
    -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP to the destination, resolving domains with the system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    pub idle_timeout: Option<Duration>,
    pub queue_depth: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(300)),
            queue_depth: 16,
        }
    }
}

/// Single connection attempt, bounded by `timeout` when set.
pub async fn connect<C: Connector>(
    connector: &C,
    destination: &Destination,
    timeout: Option<Duration>,
) -> Result<C::Stream, TunnelError> {
    debug!(target_addr = %destination, "Attempting to connect to destination");

    let attempt = connector.connect(&destination.host, destination.port);
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))),
        None => attempt.await,
    };

    let stream = result.map_err(|source| TunnelError::Connect {
        destination: destination.to_string(),
        source,
    })?;
    info!(target_addr = %destination, "Connected to destination");
    Ok(stream)
}

/// Pumps bytes between the inbound message stream and `outbound` until one
/// side finishes.
///
/// `first_payload` goes to `outbound` before the acknowledgement is sent, and
/// the acknowledgement goes out before any byte read from `outbound`. The
/// outbound stream is shut down and dropped on every exit path; closing the
/// inbound stream is left to the caller, which owns it.
pub async fn run<T, K, R>(
    outbound: T,
    sink: &mut K,
    stream: &mut R,
    first_payload: Bytes,
    options: &RelayOptions,
) -> Result<(), TunnelError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(outbound);

    if !first_payload.is_empty() {
        debug!(bytes = first_payload.len(), "Writing first payload to destination");
        writer
            .write_all(&first_payload)
            .await
            .map_err(|e| TunnelError::stream("failed to write first payload", e))?;
    }

    sink.send(Message::Binary(Bytes::copy_from_slice(
        &HandshakeResponse::connected().encode(),
    )))
    .await
    .map_err(|e| TunnelError::stream("failed to send handshake response", e))?;

    let activity = Activity::new();
    let result = tokio::select! {
        result = inbound_to_outbound(stream, &mut writer, options.queue_depth, &activity) => result,
        result = outbound_to_inbound(&mut reader, sink, &activity) => result,
        idle = idle_watchdog(options.idle_timeout, &activity) => Err(TunnelError::IdleTimeout(idle)),
    };

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Destination already closed");
    }
    result
}

async fn inbound_to_outbound<R, W>(
    stream: &mut R,
    writer: &mut W,
    queue_depth: usize,
    activity: &Activity,
) -> Result<(), TunnelError>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(queue_depth);

    let receive = async move {
        while let Some(msg) = stream.next().await {
            let data = match msg {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Inbound stream closed");
                    break;
                }
                Err(e) if is_disconnect(&e) => {
                    debug!("Client disconnected: {e}");
                    break;
                }
                Err(e) => return Err(TunnelError::stream("failed to read inbound stream", e)),
                Ok(_) => continue,
            };

            activity.touch();
            if tx.send(data).await.is_err() {
                break;
            }
        }
        Ok(())
    };

    let forward = async {
        while let Some(data) = rx.recv().await {
            debug!(bytes = data.len(), "Forwarding data from WebSocket to destination");
            writer
                .write_all(&data)
                .await
                .map_err(|e| TunnelError::stream("failed to write to destination", e))?;
            activity.touch();
        }
        Ok::<(), TunnelError>(())
    };

    tokio::try_join!(receive, forward).map(|_| ())
}

async fn outbound_to_inbound<Rd, K>(
    reader: &mut Rd,
    sink: &mut K,
    activity: &Activity,
) -> Result<(), TunnelError>
where
    Rd: AsyncRead + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];

    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|e| TunnelError::stream("failed to read from destination", e))?;
        if n == 0 {
            info!("Destination connection closed");
            return Ok(());
        }

        activity.touch();
        debug!(bytes = n, "Forwarding data from destination to WebSocket");
        match sink
            .send(Message::Binary(Bytes::copy_from_slice(&buffer[..n])))
            .await
        {
            Ok(()) => {}
            Err(e) if is_disconnect(&e) => {
                debug!("Inbound stream no longer open: {e}");
                return Ok(());
            }
            Err(e) => return Err(TunnelError::stream("failed to send WebSocket message", e)),
        }
    }
}

async fn idle_watchdog(limit: Option<Duration>, activity: &Activity) -> Duration {
    let Some(limit) = limit else {
        return std::future::pending().await;
    };

    loop {
        let idle = activity.idle_for();
        if idle >= limit {
            return idle;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

pub(crate) fn is_disconnect(e: &WsError) -> bool {
    matches!(
        e,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

/// Last time any byte moved in either direction.
struct Activity {
    origin: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_millis.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::{Arc, Mutex};
    use tokio::io::duplex;

    /// Sink that records every message it is handed.
    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<Message>>>,
    }

    impl Sink<Message> for RecordingSink {
        type Error = WsError;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), WsError>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(self: std::pin::Pin<&mut Self>, item: Message) -> Result<(), WsError> {
            self.sent.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), WsError>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), WsError>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn binary(data: &[u8]) -> Result<Message, WsError> {
        Ok(Message::Binary(Bytes::copy_from_slice(data)))
    }

    mod connecting {
        use super::*;

        struct RefusingConnector;

        impl Connector for RefusingConnector {
            type Stream = tokio::io::DuplexStream;

            async fn connect(&self, _host: &str, _port: u16) -> io::Result<Self::Stream> {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            }
        }

        struct StalledConnector;

        impl Connector for StalledConnector {
            type Stream = tokio::io::DuplexStream;

            async fn connect(&self, _host: &str, _port: u16) -> io::Result<Self::Stream> {
                std::future::pending().await
            }
        }

        fn destination() -> Destination {
            Destination {
                host: "abc".to_string(),
                port: 80,
            }
        }

        #[tokio::test]
        async fn refused_connect_is_connect_error() {
            let err = connect(&RefusingConnector, &destination(), None)
                .await
                .unwrap_err();
            assert!(matches!(err, TunnelError::Connect { ref destination, .. } if destination == "abc:80"));
        }

        #[tokio::test]
        async fn connect_timeout_is_connect_error() {
            let err = connect(
                &StalledConnector,
                &destination(),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
            match err {
                TunnelError::Connect { source, .. } => {
                    assert_eq!(source.kind(), io::ErrorKind::TimedOut);
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn tcp_connector_reaches_local_listener() {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();

            let stream = TcpConnector.connect("127.0.0.1", port).await.unwrap();
            assert!(stream.nodelay().unwrap());
        }
    }

    mod relaying {
        use super::*;

        #[tokio::test]
        async fn writes_payload_before_acknowledging() {
            let outbound = tokio_test::io::Builder::new()
                .write(b"AB")
                .read(b"pong")
                .build();
            let mut sink = RecordingSink::default();
            let mut inbound = stream::pending::<Result<Message, WsError>>();

            run(
                outbound,
                &mut sink,
                &mut inbound,
                Bytes::from_static(b"AB"),
                &RelayOptions::default(),
            )
            .await
            .unwrap();

            let sent = sink.sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert!(matches!(&sent[0], Message::Binary(ack) if ack.len() == 20 && ack[0] == 0));
            assert_eq!(sent[1], Message::Binary(Bytes::from_static(b"pong")));
        }

        #[tokio::test]
        async fn forwards_inbound_frames_in_order() {
            let (outbound, mut remote) = duplex(1024);
            let mut sink = RecordingSink::default();
            let mut inbound = stream::iter(vec![
                binary(b"one "),
                Ok(Message::Text("two ".into())),
                Ok(Message::Ping(Bytes::from_static(b"skip"))),
                binary(b"three"),
                Ok(Message::Close(None)),
            ]);

            run(
                outbound,
                &mut sink,
                &mut inbound,
                Bytes::new(),
                &RelayOptions::default(),
            )
            .await
            .unwrap();

            let mut received = Vec::new();
            remote.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, b"one two three");
        }

        #[tokio::test]
        async fn inbound_end_shuts_down_destination() {
            let (outbound, mut remote) = duplex(1024);
            let mut sink = RecordingSink::default();
            let mut inbound = stream::iter(vec![Err(WsError::ConnectionClosed)]);

            run(
                outbound,
                &mut sink,
                &mut inbound,
                Bytes::new(),
                &RelayOptions::default(),
            )
            .await
            .unwrap();

            let mut buf = [0u8; 8];
            assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
        }

        #[tokio::test]
        async fn inbound_protocol_error_is_stream_error() {
            let (outbound, _remote) = duplex(1024);
            let mut sink = RecordingSink::default();
            let mut inbound = stream::iter(vec![Err(WsError::Protocol(
                ProtocolError::NonZeroReservedBits,
            ))]);

            let err = run(
                outbound,
                &mut sink,
                &mut inbound,
                Bytes::new(),
                &RelayOptions::default(),
            )
            .await
            .unwrap_err();
            assert_eq!(err.kind(), "stream");
        }

        #[tokio::test]
        async fn idle_session_times_out() {
            let (outbound, _remote) = duplex(1024);
            let mut sink = RecordingSink::default();
            let mut inbound = stream::pending::<Result<Message, WsError>>();
            let options = RelayOptions {
                idle_timeout: Some(Duration::from_millis(100)),
                ..RelayOptions::default()
            };

            let err = run(outbound, &mut sink, &mut inbound, Bytes::new(), &options)
                .await
                .unwrap_err();
            assert!(matches!(err, TunnelError::IdleTimeout(idle) if idle >= Duration::from_millis(100)));
        }

        #[tokio::test]
        async fn large_reads_are_chunked() {
            let (outbound, mut remote) = duplex(BUFFER_SIZE * 4);
            let mut sink = RecordingSink::default();
            let mut inbound = stream::pending::<Result<Message, WsError>>();

            let data = vec![0xAB; BUFFER_SIZE * 2 + 10];
            remote.write_all(&data).await.unwrap();
            drop(remote);

            run(
                outbound,
                &mut sink,
                &mut inbound,
                Bytes::new(),
                &RelayOptions::default(),
            )
            .await
            .unwrap();

            let sent = sink.sent.lock().unwrap();
            let relayed: Vec<u8> = sent[1..]
                .iter()
                .flat_map(|msg| match msg {
                    Message::Binary(data) => {
                        assert!(data.len() <= BUFFER_SIZE);
                        data.to_vec()
                    }
                    other => panic!("unexpected message: {other:?}"),
                })
                .collect();
            assert_eq!(relayed, data);
        }
    }
}
