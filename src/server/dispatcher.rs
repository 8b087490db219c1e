//! The listener loop.
//!
//! Accepts sockets on the server's runtime and hands each one to a worker
//! thread, round-robin. Sockets over the connection limit are closed at once.

use super::worker::{WorkerEvent, WorkerShared};
use super::ServerContext;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    listener: TcpListener,
    server: Arc<ServerContext>,
    workers: Vec<Arc<WorkerShared>>,
    next: usize,
}

impl Dispatcher {
    pub fn new(
        listener: TcpListener,
        server: Arc<ServerContext>,
        workers: Vec<Arc<WorkerShared>>,
    ) -> Self {
        Self {
            listener,
            server,
            workers,
            next: 0,
        }
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.dispatch(stream, addr),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        // Typically out of descriptors; back off briefly
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, stream: TcpStream, addr: SocketAddr) {
        let limit = self.server.settings.max_connections;
        if self.server.connections.len() >= limit {
            self.server.connections.stats().connection_rejected();
            warn!(%addr, limit, "Too many connections, rejecting");
            return;
        }
        if self.workers.is_empty() {
            return;
        }

        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%addr, error = %e, "Failed to detach accepted socket");
                return;
            }
        };

        let thread = self.next % self.workers.len();
        self.next = self.next.wrapping_add(1);
        if self.workers[thread].send(WorkerEvent::NewConnection(stream)) {
            debug!(%addr, thread, "Connection dispatched");
        } else {
            warn!(%addr, thread, "Worker is gone, dropping connection");
        }
    }
}
