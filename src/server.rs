use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TunnelSettings};
use crate::proxy::handle_connection;
use crate::security::PeerAllowlist;
use crate::stream::InboundStream;
use crate::tls::load_tls_acceptor;

/// Bound listener plus everything a connection task needs.
///
/// All configuration is validated in [`Server::bind`]; nothing read from the
/// config can fail once the accept loop is running.
pub struct Server {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    allowlist: Arc<PeerAllowlist>,
    path: Arc<str>,
    settings: Arc<TunnelSettings>,
}

impl Server {
    pub async fn bind(config: &Config) -> Result<Self> {
        let settings = config.tunnel.settings()?;
        let allowlist = PeerAllowlist::parse(config.listen.allowed_proxy_ips.as_deref())?;
        let tls = config
            .listen
            .tls
            .as_ref()
            .map(load_tls_acceptor)
            .transpose()?;

        let addr = format!("{}:{}", config.listen.ip, config.listen.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to address {addr}"))?;

        Ok(Self {
            listener,
            tls,
            allowlist: Arc::new(allowlist),
            path: config.listen.path.as_str().into(),
            settings: Arc::new(settings),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to get listener local address")
    }

    /// Accepts connections until the listener fails; each one runs in its
    /// own task.
    pub async fn run(self) -> Result<()> {
        info!(
            listen_addr = %self.local_addr()?,
            tls = self.tls.is_some(),
            path = %self.path,
            "Tunnel endpoint listening"
        );

        loop {
            let (tcp, client_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            if !self.allowlist.allows(client_addr.ip()) {
                warn!(client_addr = %client_addr, "Rejecting connection from disallowed peer");
                continue;
            }

            if let Err(e) = tcp.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }

            let tls = self.tls.clone();
            let path = self.path.clone();
            let settings = self.settings.clone();

            tokio::spawn(async move {
                let stream = match tls {
                    Some(acceptor) => match acceptor.accept(tcp).await {
                        Ok(tls_stream) => InboundStream::Tls(Box::new(tls_stream)),
                        Err(e) => {
                            warn!(client_addr = %client_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                    },
                    None => InboundStream::Plain(tcp),
                };

                if let Err(e) = handle_connection(stream, client_addr, &path, settings).await {
                    error!(client_addr = %client_addr, error = %e, "Connection failed");
                }
            });
        }
    }
}
