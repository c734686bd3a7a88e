//! Proxy server wiring.
//!
//! Hosts a flow handler (recording or playback) inside the hudsucker MITM
//! proxy: TLS interception with the managed CA, HTTP/1.1 end to end. The
//! server either runs in the foreground until shutdown or starts in the
//! background behind a [`ProxyHandle`].

use std::net::SocketAddr;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::{HttpHandler, Proxy};
use tokio::sync::broadcast;

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};

/// MITM proxy server around a flow handler.
pub struct ProxyServer<H> {
    addr: SocketAddr,
    ca_manager: CaManager,
    handler: H,
}

impl<H> ProxyServer<H>
where
    H: HttpHandler,
{
    /// Creates a server, generating the CA on first use.
    pub fn new(addr: SocketAddr, ca_manager: CaManager, handler: H) -> Result<Self> {
        ca_manager.ensure_ca().map_err(ProxyError::Ca)?;
        Ok(ProxyServer {
            addr,
            ca_manager,
            handler,
        })
    }

    /// Creates a server listening on localhost at the given port.
    pub fn on_port(port: u16, ca_manager: CaManager, handler: H) -> Result<Self> {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)), ca_manager, handler)
    }

    /// The address the proxy will listen on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The CA certificate path for browser installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.ca_manager.cert_path()
    }

    /// Runs the proxy in the foreground until it is shut down.
    pub async fn run(self) -> Result<()> {
        let authority = self.ca_manager.ensure_ca().map_err(ProxyError::Ca)?;

        tracing::info!("starting MITM proxy on {}", self.addr);
        tracing::info!("CA certificate: {:?}", self.ca_manager.cert_path());

        let proxy = Proxy::builder()
            .with_addr(self.addr)
            .with_ca(authority)
            .with_rustls_client(default_provider())
            .with_http_handler(self.handler)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        proxy
            .start()
            .await
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("proxy server stopped");
        Ok(())
    }

    /// Starts the proxy in the background and returns a control handle.
    pub fn start(self) -> Result<ProxyHandle> {
        let authority = self.ca_manager.ensure_ca().map_err(ProxyError::Ca)?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let shutdown = shutdown_tx.clone();
        let addr = self.addr;
        let handler = self.handler;

        let handle = tokio::spawn(async move {
            let proxy = match Proxy::builder()
                .with_addr(addr)
                .with_ca(authority)
                .with_rustls_client(default_provider())
                .with_http_handler(handler)
                .build()
            {
                Ok(proxy) => proxy,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build proxy");
                    return;
                }
            };

            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "proxy error");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("proxy shutdown signal received");
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for a proxy running in the background.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// The address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A shutdown sender other tasks (the watcher) can subscribe to.
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy task to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down and waits.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::replayer::{PlaybackHandler, Replayer};
    use crate::upstream::UpstreamClient;

    fn playback_handler(dir: &TempDir) -> PlaybackHandler {
        let replayer = Replayer::new(dir.path().join("inventory")).unwrap();
        let upstream = Arc::new(UpstreamClient::new().unwrap());
        PlaybackHandler::new(replayer, upstream)
    }

    #[test]
    fn on_port_binds_localhost() {
        let dir = TempDir::new().unwrap();
        let ca = CaManager::new(dir.path().join("ca"));
        let server = ProxyServer::on_port(8080, ca, playback_handler(&dir)).unwrap();
        assert_eq!(server.addr().to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn new_generates_the_ca() {
        let dir = TempDir::new().unwrap();
        let ca = CaManager::new(dir.path().join("ca"));
        let server = ProxyServer::new(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            ca,
            playback_handler(&dir),
        )
        .unwrap();
        assert!(server.ca_cert_path().exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_proxy_starts_and_stops() {
        let dir = TempDir::new().unwrap();
        let ca = CaManager::new(dir.path().join("ca"));
        let server = ProxyServer::new(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            ca,
            playback_handler(&dir),
        )
        .unwrap();

        let handle = server.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;
    }
}
