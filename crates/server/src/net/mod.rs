//! TCP transport for the FsGate line protocol.
//!
//! ## Overview
//!
//! Each accepted connection gets its own worker task owning exactly one
//! [`Session`](crate::session::Session). The worker greets the client, then
//! loops: read one request line, dispatch it, write one response unit.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use server::net::{ConnectionLimits, ConnectionListener, FsClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(dispatcher: Arc<server::CommandDispatcher>) -> anyhow::Result<()> {
//! let listener = ConnectionListener::bind("127.0.0.1:0", ConnectionLimits::default()).await?;
//! let addr = listener.local_addr()?;
//! let shutdown = CancellationToken::new();
//! tokio::spawn(listener.serve(dispatcher, shutdown.clone()));
//!
//! let mut client = FsClient::connect(addr, protocol::Delimiter::Whitespace).await?;
//! client.login("alice", "secret").await?;
//! let listing = client.view(".").await?;
//! println!("{}", listing);
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod listener;

pub use client::{ClientError, FsClient};
pub use connection::LineConnection;
pub use listener::{ConnectionLimits, ConnectionListener, GREETING};

use std::io;

use protocol::ProtocolError;
use thiserror::Error;

/// Errors that can occur on a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent something that is not a valid line or response.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer closed the connection in the middle of a response.
    #[error("connection closed by peer")]
    Closed,
}
