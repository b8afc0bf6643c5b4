//! Connection listener.
//!
//! Accepts TCP connections and runs one worker task per connection. The
//! number of concurrently served connections is capped with a semaphore;
//! connections over the cap are told the server is busy and closed.
//!
//! # Shutdown
//!
//! Cancelling the shutdown token stops the accept loop. Workers waiting for
//! a request close their connection at once; a worker that has already read
//! a request finishes dispatching it and writes the response first.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::{ErrorCode, Response};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{ConnectionError, LineConnection};
use crate::config::Config;
use crate::dispatcher::CommandDispatcher;

/// Message of the greeting sent to every accepted connection.
pub const GREETING: &str = "FsGate ready";

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-listener connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Maximum number of concurrently served connections.
    pub max_connections: usize,
    /// Longest accepted request line in bytes.
    pub max_line_length: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ConnectionLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_connections: config.server.max_connections,
            max_line_length: config.protocol.max_line_length,
        }
    }
}

/// Accepts connections and hands each to its own worker.
pub struct ConnectionListener {
    listener: TcpListener,
    limits: ConnectionLimits,
}

impl ConnectionListener {
    /// Bind the listener to the given address.
    pub async fn bind<A: ToSocketAddrs>(addr: A, limits: ConnectionLimits) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, limits })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve connections until `shutdown` is cancelled, then wait for
    /// every worker to finish.
    pub async fn serve(self, dispatcher: Arc<CommandDispatcher>, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        let permits = Arc::new(Semaphore::new(self.limits.max_connections));

        info!(
            addr = ?self.listener.local_addr().ok(),
            max_connections = self.limits.max_connections,
            "Listening for connections"
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Listener received shutdown signal");
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                warn!(peer = %peer, "Connection limit reached, refusing connection");
                tracker.spawn(refuse_busy(stream, self.limits.max_line_length));
                continue;
            };

            let dispatcher = Arc::clone(&dispatcher);
            let shutdown = shutdown.clone();
            let max_line_length = self.limits.max_line_length;
            tracker.spawn(async move {
                let _permit = permit;
                serve_connection(stream, peer, dispatcher, shutdown, max_line_length).await;
            });
        }

        tracker.close();
        debug!(workers = tracker.len(), "Waiting for workers to finish");
        tracker.wait().await;
        info!("Listener stopped");
    }
}

async fn refuse_busy(stream: TcpStream, max_line_length: usize) {
    let mut conn = LineConnection::new(stream, max_line_length);
    let busy = Response::error(ErrorCode::Io, "server busy");
    if let Err(e) = conn.send_response(&busy).await {
        debug!(error = %e, "Failed to send busy response");
    }
    let _ = conn.shutdown().await;
}

/// Worker loop for one connection.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: CancellationToken,
    max_line_length: usize,
) {
    let mut conn = LineConnection::new(stream, max_line_length);
    let mut session = dispatcher.new_session();
    let connection_id = session.id();
    info!(connection_id = %connection_id, peer = %peer, "Connection accepted");

    if let Err(e) = conn.send_response(&Response::ok(GREETING)).await {
        warn!(connection_id = %connection_id, error = %e, "Failed to send greeting");
        return;
    }

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(connection_id = %connection_id, "Closing idle connection for shutdown");
                break;
            }
            read = conn.read_line() => read,
        };

        let line = match read {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(connection_id = %connection_id, "Client disconnected");
                break;
            }
            Err(ConnectionError::Protocol(e)) => {
                debug!(connection_id = %connection_id, error = %e, "Rejected request line");
                let response = Response::error(ErrorCode::Protocol, e.to_string());
                if let Err(e) = conn.send_response(&response).await {
                    warn!(connection_id = %connection_id, error = %e, "Failed to send response");
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Connection read failed");
                break;
            }
        };

        // File operations block, so the session makes a round trip through
        // the blocking pool.
        let worker_dispatcher = Arc::clone(&dispatcher);
        let joined = tokio::task::spawn_blocking(move || {
            let mut session = session;
            let dispatch = worker_dispatcher.dispatch(&mut session, &line);
            (session, dispatch)
        })
        .await;

        let dispatch = match joined {
            Ok((returned, dispatch)) => {
                session = returned;
                dispatch
            }
            Err(e) => {
                error!(connection_id = %connection_id, error = %e, "Dispatch task failed");
                return;
            }
        };

        if let Err(e) = conn.send_response(&dispatch.response).await {
            warn!(connection_id = %connection_id, error = %e, "Failed to send response");
            break;
        }

        if dispatch.close {
            break;
        }
    }

    let _ = conn.shutdown().await;
    info!(
        connection_id = %connection_id,
        user = session.authenticated_user().unwrap_or("-"),
        "Connection closed"
    );
}
