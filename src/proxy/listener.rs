use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::ProxyError;

/// An axum server on one socket that can be stopped gracefully: it stops
/// accepting immediately and lets accepted connections finish.
pub struct Listener {
    label: &'static str,
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Listener {
    pub async fn bind(label: &'static str, ip: &str, port: u16, router: Router) -> Result<Self, ProxyError> {
        let socket = bind_socket(ip, port).await?;
        Ok(Self::serve(label, socket, router))
    }

    fn serve(label: &'static str, socket: TcpListener, router: Router) -> Self {
        let addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                // Only fails for unconnected sockets; a bound listener always has one.
                error!(label, error = %e, "listener has no local address");
                SocketAddr::from(([0, 0, 0, 0], 0))
            }
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let server = axum::serve(socket, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = server.await {
                error!(label, error = %err, "server error");
            }
            debug!(label, %addr, "listener drained");
        });
        info!(label, %addr, "listening");
        Self {
            label,
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Move to a new port. The new socket is bound first, so a failure leaves
    /// the current listener untouched. On success the old listener stops
    /// accepting before the new one starts, and drains in the background.
    pub async fn rebind(&mut self, ip: &str, port: u16, router: Router) -> Result<(), ProxyError> {
        let socket = bind_socket(ip, port).await?;
        let old_addr = self.addr;
        let draining = self.stop_accepting();
        *self = Self::serve(self.label, socket, router);
        info!(label = self.label, from = %old_addr, to = %self.addr, "listener moved");
        tokio::spawn(async move {
            let _ = draining.await;
        });
        Ok(())
    }

    /// Stop accepting and wait for in-flight connections to finish.
    pub async fn stop(mut self) {
        let handle = self.stop_accepting();
        let _ = handle.await;
    }

    fn stop_accepting(&mut self) -> JoinHandle<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        std::mem::replace(&mut self.handle, tokio::spawn(async {}))
    }
}

async fn bind_socket(ip: &str, port: u16) -> Result<TcpListener, ProxyError> {
    TcpListener::bind((ip, port))
        .await
        .map_err(|source| ProxyError::Bind {
            addr: format!("{}:{}", ip, port),
            source,
        })
}
