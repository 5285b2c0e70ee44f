use anyhow::{Context, Result};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};
use tracing::{debug, info, warn};

use crate::config::TunnelSettings;
use crate::relay::TcpConnector;
use crate::security::parse_original_client_ip;
use crate::session::Session;
use crate::stream::InboundStream;

/// Upgrades one accepted connection to a WebSocket and runs a tunnel
/// session over it.
///
/// Upgrade requests for any path other than `path` are refused with 404.
/// Session failures are logged here and never returned; only a failed upgrade
/// is an error.
#[tracing::instrument(skip(stream, path, settings), fields(tls = stream.is_tls()))]
pub async fn handle_connection(
    stream: InboundStream,
    client_addr: SocketAddr,
    path: &str,
    settings: Arc<TunnelSettings>,
) -> Result<()> {
    let host_header = Arc::new(Mutex::new(None::<String>));
    let host_header_clone = host_header.clone();
    let client_ip = Arc::new(Mutex::new(None::<String>));
    let client_ip_clone = client_ip.clone();
    let expected_path = path.to_string();

    let callback = move |req: &Request, response: Response| {
        if req.uri().path() != expected_path {
            debug!(path = %req.uri().path(), "Refusing upgrade for unknown path");
            let mut refusal = ErrorResponse::new(Some("Not Found".to_string()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            return Err(refusal);
        }

        if let Some(host) = req.headers().get("host").and_then(|h| h.to_str().ok()) {
            if let Ok(mut guard) = host_header_clone.lock() {
                *guard = Some(host.to_string());
            }
        }

        // Extract original client IP from X-Forwarded-For header
        if let Some(original_ip) = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|xff| xff.to_str().ok())
            .and_then(parse_original_client_ip)
        {
            if let Ok(mut guard) = client_ip_clone.lock() {
                *guard = Some(original_ip);
            }
        }

        Ok(response)
    };

    let websocket = accept_hdr_async(stream, callback)
        .await
        .context("Failed to perform WebSocket handshake")?;

    let host = host_header.lock().ok().and_then(|guard| guard.clone());
    let original_client_ip = client_ip.lock().ok().and_then(|guard| guard.clone());

    // Log with original client IP if available, otherwise use direct connection IP
    match original_client_ip {
        Some(ref ip) => info!(
            host = host.as_deref().unwrap_or("-"),
            client_ip = %ip,
            direct_addr = %client_addr,
            "Tunnel session opened"
        ),
        None => info!(
            host = host.as_deref().unwrap_or("-"),
            client_ip = %client_addr,
            "Tunnel session opened"
        ),
    }

    let mut session = Session::new(settings, TcpConnector);
    match session.run(websocket).await {
        Ok(()) => info!("Tunnel session closed"),
        Err(e) => warn!(kind = e.kind(), error = %e, "Tunnel session failed"),
    }
    Ok(())
}
