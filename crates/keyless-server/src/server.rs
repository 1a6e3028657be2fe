//! Listener and connection supervision.
//!
//! One accept loop hands each connection to its own task. Live
//! connections are tracked so a shutdown can sweep them: the broadcast
//! notifies every connection, the tracker waits for all of them to
//! finish tearing down.

use std::net::SocketAddr;
use std::sync::Arc;

use keyless_crypto::KeyStore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_util::task::TaskTracker;

use crate::connection;

pub struct Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    keystore: Arc<KeyStore>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the listening socket. Nothing is accepted until [`Server::run`].
    pub async fn bind(
        addr: SocketAddr,
        tls_config: Arc<rustls::ServerConfig>,
        keystore: Arc<KeyStore>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls_config),
            keystore,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for requesting shutdown from signal handlers or tests.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept connections until shutdown is requested, then sweep every
    /// live connection and wait for all of them to finish.
    pub async fn run(self) {
        let tracker = TaskTracker::new();
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            self.spawn_connection(&tracker, socket, peer);
                        }
                        Err(e) => {
                            tracing::warn!("accept failed: {e}");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("shutdown requested, stopping listener");
                    break;
                }
            }
        }

        drop(self.listener);
        tracker.close();
        tracker.wait().await;
        tracing::info!("all connections drained");
    }

    fn spawn_connection(&self, tracker: &TaskTracker, socket: TcpStream, peer: SocketAddr) {
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(%peer, "set_nodelay failed: {e}");
        }
        let acceptor = self.acceptor.clone();
        let keystore = self.keystore.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tracker.spawn(async move {
            match acceptor.accept(socket).await {
                Ok(stream) => {
                    tracing::info!(%peer, "accepted connection");
                    connection::run(stream, peer, keystore, shutdown).await;
                    tracing::debug!(%peer, "connection finished");
                }
                Err(e) => {
                    tracing::warn!(%peer, "TLS handshake failed: {e}");
                }
            }
        });
    }
}
