//! Line-oriented connection shared by the server workers and the client.

use std::io;

use protocol::{ProtocolError, Response, ResponseDecoder};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};

use super::ConnectionError;

/// A byte stream read and written one line at a time.
///
/// Incoming lines longer than `max_line_length` bytes (excluding the line
/// ending) are discarded up to their newline and reported as
/// [`ProtocolError::LineTooLong`], leaving the stream positioned at the
/// next line.
pub struct LineConnection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    max_line_length: usize,
}

impl<S> LineConnection<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap a connected stream.
    pub fn new(stream: S, max_line_length: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            max_line_length,
        }
    }

    /// Read the next line without its line ending.
    ///
    /// Returns `None` if the peer has disconnected. A final line without a
    /// trailing newline is still returned.
    pub async fn read_line(&mut self) -> Result<Option<String>, ConnectionError> {
        let mut buf = Vec::new();
        // Room for the "\r\n" after a maximal line.
        let limit = self.max_line_length as u64 + 2;

        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }

        if buf.last() != Some(&b'\n') && read as u64 == limit {
            let len = buf.len() + self.discard_line().await?;
            return Err(ProtocolError::LineTooLong {
                len,
                max: self.max_line_length,
            }
            .into());
        }

        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        if buf.len() > self.max_line_length {
            return Err(ProtocolError::LineTooLong {
                len: buf.len(),
                max: self.max_line_length,
            }
            .into());
        }

        let line = String::from_utf8(buf).map_err(ProtocolError::from)?;
        Ok(Some(line))
    }

    /// Skip the rest of the current line; returns the bytes skipped.
    async fn discard_line(&mut self) -> io::Result<usize> {
        let mut skipped = 0;
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(skipped);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.reader.consume(i + 1);
                    return Ok(skipped + i);
                }
                None => {
                    let n = available.len();
                    self.reader.consume(n);
                    skipped += n;
                }
            }
        }
    }

    /// Read one complete response unit.
    ///
    /// Returns `None` if the peer disconnected before sending anything.
    pub async fn read_response(&mut self) -> Result<Option<Response>, ConnectionError> {
        let mut decoder = ResponseDecoder::new();
        let mut started = false;

        loop {
            let Some(line) = self.read_line().await? else {
                return if started {
                    Err(ConnectionError::Closed)
                } else {
                    Ok(None)
                };
            };
            started = true;

            if let Some(response) = decoder.push_line(&line)? {
                return Ok(Some(response));
            }
        }
    }

    /// Send one line, appending the newline.
    pub async fn send_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        let mut data = String::with_capacity(line.len() + 1);
        data.push_str(line);
        data.push('\n');

        self.writer.write_all(data.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send a response unit.
    pub async fn send_response(&mut self, response: &Response) -> Result<(), ConnectionError> {
        self.writer.write_all(response.encode().as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write side.
    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::ErrorCode;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_lines() {
        let (client, server) = duplex(1024);
        let mut server = LineConnection::new(server, 64);
        let mut client = LineConnection::new(client, 64);

        client.send_line("VIEW docs").await.unwrap();
        client.send_line("PWD\r").await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(server.read_line().await.unwrap().unwrap(), "VIEW docs");
        assert_eq!(server.read_line().await.unwrap().unwrap(), "PWD");
        assert!(server.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_too_long_is_skipped() {
        let (client, server) = duplex(4096);
        let mut server = LineConnection::new(server, 16);
        let mut client = LineConnection::new(client, 1024);

        client.send_line(&"x".repeat(100)).await.unwrap();
        client.send_line("PWD").await.unwrap();

        let err = server.read_line().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::LineTooLong { len: 100, max: 16 })
        ));
        assert_eq!(server.read_line().await.unwrap().unwrap(), "PWD");
    }

    #[tokio::test]
    async fn test_line_at_limit_is_accepted() {
        let (client, server) = duplex(1024);
        let mut server = LineConnection::new(server, 8);
        let mut client = LineConnection::new(client, 64);

        client.send_line("12345678").await.unwrap();
        assert_eq!(server.read_line().await.unwrap().unwrap(), "12345678");
    }

    #[tokio::test]
    async fn test_invalid_utf8() {
        let (client, server) = duplex(1024);
        let mut server = LineConnection::new(server, 64);
        let (_read, mut write) = tokio::io::split(client);

        write.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();
        write.write_all(b"PWD\n").await.unwrap();

        let err = server.read_line().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::InvalidUtf8)
        ));
        assert_eq!(server.read_line().await.unwrap().unwrap(), "PWD");
    }

    #[tokio::test]
    async fn test_response_exchange() {
        let (client, server) = duplex(1024);
        let mut server = LineConnection::new(server, 64);
        let mut client = LineConnection::new(client, 64);

        let response = Response::ok_with_body("listing of /", vec![".hidden".to_string()]);
        server.send_response(&response).await.unwrap();
        server
            .send_response(&Response::error(ErrorCode::NotFound, "not found: /x"))
            .await
            .unwrap();

        assert_eq!(client.read_response().await.unwrap().unwrap(), response);
        let second = client.read_response().await.unwrap().unwrap();
        assert_eq!(second.code, Some(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn test_truncated_response() {
        let (client, server) = duplex(1024);
        let mut client = LineConnection::new(client, 64);
        let mut server = LineConnection::new(server, 64);

        server.send_line("OK listing").await.unwrap();
        server.shutdown().await.unwrap();
        drop(server);

        assert!(matches!(
            client.read_response().await,
            Err(ConnectionError::Closed)
        ));
    }
}
