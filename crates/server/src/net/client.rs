//! Async client for the FsGate line protocol.
//!
//! Used by the integration tests and by anything that wants to drive a
//! server programmatically. Every request waits for exactly one response.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use protocol::{Command, Delimiter, ProtocolError, Response, Verb};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};

use super::{ConnectionError, LineConnection};
use crate::config::Config;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Errors returned by [`FsClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("invalid request: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("operation timed out")]
    TimedOut,

    /// The server answered with `ERR`.
    #[error("server rejected request: {0}")]
    Rejected(Response),

    /// A download did not decode or did not match its digest.
    #[error("corrupt transfer: {0}")]
    Corrupt(String),
}

/// A connected FsGate client.
pub struct FsClient {
    conn: LineConnection<TcpStream>,
    delimiter: Delimiter,
    timeout: Duration,
    greeting: Response,
}

impl FsClient {
    /// Connect and read the server greeting.
    ///
    /// # Errors
    ///
    /// Fails if the connection cannot be established, or if the server
    /// answers the connection with an error (for example when busy).
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        delimiter: Delimiter,
    ) -> Result<Self, ClientError> {
        let timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);
        Self::connect_with_timeout(addr, delimiter, timeout).await
    }

    /// Connect with a custom timeout applied to the connect and to every
    /// later request.
    pub async fn connect_with_timeout<A: ToSocketAddrs>(
        addr: A,
        delimiter: Delimiter,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::TimedOut)?
            .map_err(ConnectionError::from)?;

        let mut conn = LineConnection::new(stream, Config::default().protocol.max_line_length);
        let greeting = tokio::time::timeout(timeout, conn.read_response())
            .await
            .map_err(|_| ClientError::TimedOut)??
            .ok_or(ConnectionError::Closed)?;

        if !greeting.is_ok() {
            return Err(ClientError::Rejected(greeting));
        }

        Ok(Self {
            conn,
            delimiter,
            timeout,
            greeting,
        })
    }

    /// The greeting the server sent on connect.
    pub fn greeting(&self) -> &Response {
        &self.greeting
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a command and return the response, whatever its status.
    pub async fn send(&mut self, command: &Command) -> Result<Response, ClientError> {
        let line = command.to_line(self.delimiter)?;
        self.send_line(&line).await
    }

    /// Send a raw request line and return the response.
    pub async fn send_line(&mut self, line: &str) -> Result<Response, ClientError> {
        tokio::time::timeout(self.timeout, self.exchange(line))
            .await
            .map_err(|_| ClientError::TimedOut)?
    }

    async fn exchange(&mut self, line: &str) -> Result<Response, ClientError> {
        self.conn.send_line(line).await?;
        let response = self
            .conn
            .read_response()
            .await?
            .ok_or(ConnectionError::Closed)?;
        Ok(response)
    }

    /// Send a command and turn an `ERR` response into [`ClientError::Rejected`].
    async fn request<I, S>(&mut self, verb: Verb, args: I) -> Result<Response, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let response = self.send(&Command::new(verb, args)).await?;
        if response.is_ok() {
            Ok(response)
        } else {
            Err(ClientError::Rejected(response))
        }
    }

    /// Run both authentication phases.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<Response, ClientError> {
        self.request(Verb::SubmitUsername, [username]).await?;
        self.request(Verb::SubmitPassword, [password]).await
    }

    pub async fn view(&mut self, path: &str) -> Result<Response, ClientError> {
        self.request(Verb::View, [path]).await
    }

    pub async fn copy(&mut self, source: &str, destination: &str) -> Result<Response, ClientError> {
        self.request(Verb::Copy, [source, destination]).await
    }

    pub async fn move_file(
        &mut self,
        source: &str,
        destination: &str,
    ) -> Result<Response, ClientError> {
        self.request(Verb::Move, [source, destination]).await
    }

    pub async fn rename(&mut self, source: &str, new_name: &str) -> Result<Response, ClientError> {
        self.request(Verb::Rename, [source, new_name]).await
    }

    pub async fn set_dir(&mut self, path: &str) -> Result<Response, ClientError> {
        self.request(Verb::SetDir, [path]).await
    }

    pub async fn pwd(&mut self) -> Result<Response, ClientError> {
        self.request(Verb::Pwd, Vec::<String>::new()).await
    }

    /// Download a file, verifying its digest.
    pub async fn download(&mut self, path: &str) -> Result<Vec<u8>, ClientError> {
        let response = self.request(Verb::Download, [path]).await?;

        let expected = response
            .message
            .rsplit(' ')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let data = STANDARD
            .decode(response.body.concat())
            .map_err(|e| ClientError::Corrupt(e.to_string()))?;

        let actual = hex::encode(Sha256::digest(&data));
        if actual != expected {
            return Err(ClientError::Corrupt(format!(
                "sha256 mismatch: expected {}, got {}",
                expected, actual
            )));
        }
        Ok(data)
    }

    /// Upload `data` to `path`, overwriting any existing file.
    pub async fn upload(&mut self, path: &str, data: &[u8]) -> Result<Response, ClientError> {
        let payload = STANDARD.encode(data);
        self.request(Verb::Upload, [path, payload.as_str()]).await
    }

    /// End the session. The server closes the connection afterwards.
    pub async fn terminate(mut self) -> Result<Response, ClientError> {
        let response = self.request(Verb::Terminate, Vec::<String>::new()).await?;
        let _ = self.conn.shutdown().await;
        Ok(response)
    }
}
