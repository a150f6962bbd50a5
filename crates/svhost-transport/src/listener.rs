//! Per-service accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Receives every socket a [`Listener`] accepts.
///
/// Implemented by the service runtime, which runs admission control and
/// either spawns a connection or refuses the socket.
pub trait Acceptor: Send + Sync + 'static {
    fn accept(self: Arc<Self>, stream: TcpStream, peer: SocketAddr);
}

/// Accepts inbound sockets on one port until shut down.
pub struct Listener {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Listener {
    /// Bind `addr` and start the accept loop. Accepted sockets go to
    /// `acceptor` for as long as it is alive.
    pub async fn bind<A: Acceptor>(
        name: &str,
        addr: SocketAddr,
        acceptor: Weak<A>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        info!("Service '{name}' listening on {local_addr}");

        let name = name.to_string();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let Some(acceptor) = acceptor.upgrade() else {
                                break;
                            };
                            debug!("Service '{name}' accepted {peer}");
                            acceptor.accept(stream, peer);
                        }
                        Err(e) => {
                            warn!("Service '{name}' accept failed, closing listener: {e}");
                            break;
                        }
                    },
                }
            }
            // The bound socket is dropped here, releasing the port.
            info!("Service '{name}' stopped listening on {local_addr}");
        });

        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and wait for the loop to release the port.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
