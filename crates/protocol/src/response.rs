//! Response framing.
//!
//! # Wire Format
//!
//! Every response is one self-delimiting unit:
//!
//! ```text
//! OK <message>            or    ERR <CODE> <message>
//! <body line>*
//! .
//! ```
//!
//! The unit always ends with a line holding a single `.`. Body lines that
//! start with `.` are sent with one extra leading `.` which the decoder strips,
//! so the terminator can never appear inside a body.

use std::fmt;

use crate::error::{ProtocolError, Result};

/// Line that ends every response unit.
pub const TERMINATOR: &str = ".";

/// Leading status token of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The request succeeded.
    Ok,
    /// The request failed; the session is still usable.
    Err,
}

impl Status {
    /// Wire token.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Err => "ERR",
        }
    }
}

/// Category of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed request, unknown verb or wrong argument count.
    Protocol,
    /// Bad credentials, authentication required, or already authenticated.
    Auth,
    /// A path resolved outside the server root.
    Escape,
    /// The target does not exist.
    NotFound,
    /// The source has the wrong type (e.g. a directory where a file is needed).
    NotAFile,
    /// Underlying filesystem or store failure.
    Io,
}

impl ErrorCode {
    /// Wire token.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Protocol => "PROTOCOL",
            ErrorCode::Auth => "AUTH",
            ErrorCode::Escape => "ESCAPE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::NotAFile => "NOT_A_FILE",
            ErrorCode::Io => "IO",
        }
    }

    /// Parse a wire token.
    pub fn from_token(token: &str) -> Option<Self> {
        let code = match token {
            "PROTOCOL" => ErrorCode::Protocol,
            "AUTH" => ErrorCode::Auth,
            "ESCAPE" => ErrorCode::Escape,
            "NOT_FOUND" => ErrorCode::NotFound,
            "NOT_A_FILE" => ErrorCode::NotAFile,
            "IO" => ErrorCode::Io,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single response unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Leading status token.
    pub status: Status,
    /// Error category, present only when `status` is `Err`.
    pub code: Option<ErrorCode>,
    /// Human-readable single-line message.
    pub message: String,
    /// Multi-line payload (listings, file contents).
    pub body: Vec<String>,
}

impl Response {
    /// Successful response without a body.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            code: None,
            message: single_line(message.into()),
            body: Vec::new(),
        }
    }

    /// Successful response with a multi-line body.
    pub fn ok_with_body(message: impl Into<String>, body: Vec<String>) -> Self {
        Self {
            body,
            ..Self::ok(message)
        }
    }

    /// Failed response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: Status::Err,
            code: Some(code),
            message: single_line(message.into()),
            body: Vec::new(),
        }
    }

    /// Whether the status is `OK`.
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Encode the unit, including the terminator line.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(
            self.message.len() + 16 + self.body.iter().map(|l| l.len() + 2).sum::<usize>(),
        );

        out.push_str(self.status.as_str());
        if let Some(code) = self.code {
            out.push(' ');
            out.push_str(code.as_str());
        }
        if !self.message.is_empty() {
            out.push(' ');
            out.push_str(&self.message);
        }
        out.push('\n');

        for line in self.body.iter().flat_map(|l| l.split('\n')) {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.starts_with('.') {
                out.push('.');
            }
            out.push_str(line);
            out.push('\n');
        }

        out.push_str(TERMINATOR);
        out.push('\n');
        out
    }

    /// Decode a complete unit from text.
    pub fn decode(text: &str) -> Result<Self> {
        let mut decoder = ResponseDecoder::new();
        for line in text.lines() {
            if let Some(response) = decoder.push_line(line)? {
                return Ok(response);
            }
        }
        Err(ProtocolError::MalformedResponse(
            "missing terminator line".to_string(),
        ))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} {} {}", self.status.as_str(), code, self.message),
            None => write!(f, "{} {}", self.status.as_str(), self.message),
        }
    }
}

/// Incremental decoder fed one line at a time.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    head: Option<Response>,
}

impl ResponseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (with or without its newline).
    ///
    /// Returns the finished response once the terminator arrives.
    pub fn push_line(&mut self, line: &str) -> Result<Option<Response>> {
        let line = line.trim_end_matches(['\r', '\n']);

        if self.head.is_none() {
            self.head = Some(parse_status_line(line)?);
            return Ok(None);
        }

        if line == TERMINATOR {
            return Ok(self.head.take());
        }

        if let Some(head) = self.head.as_mut() {
            let unstuffed = line.strip_prefix('.').unwrap_or(line);
            head.body.push(unstuffed.to_string());
        }
        Ok(None)
    }
}

fn parse_status_line(line: &str) -> Result<Response> {
    let (status_token, rest) = split_token(line);
    match status_token {
        "OK" => Ok(Response::ok(rest)),
        "ERR" => {
            let (code_token, message) = split_token(rest);
            let code = ErrorCode::from_token(code_token).ok_or_else(|| {
                ProtocolError::MalformedResponse(format!("unknown error code {:?}", code_token))
            })?;
            Ok(Response::error(code, message))
        }
        other => Err(ProtocolError::MalformedResponse(format!(
            "unknown status token {:?}",
            other
        ))),
    }
}

fn split_token(s: &str) -> (&str, &str) {
    match s.split_once(' ') {
        Some((head, tail)) => (head, tail),
        None => (s, ""),
    }
}

fn single_line(message: String) -> String {
    if message.contains(['\r', '\n']) {
        message.replace(['\r', '\n'], " ")
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ok() {
        let response = Response::ok("User accepted");
        assert_eq!(response.encode(), "OK User accepted\n.\n");
    }

    #[test]
    fn test_encode_error() {
        let response = Response::error(ErrorCode::NotFound, "no such file: a.txt");
        assert_eq!(response.encode(), "ERR NOT_FOUND no such file: a.txt\n.\n");
    }

    #[test]
    fn test_body_dot_stuffing() {
        let response = Response::ok_with_body(
            "content of notes.txt",
            vec![".".to_string(), "..hidden".to_string(), "plain".to_string()],
        );
        let encoded = response.encode();
        assert_eq!(
            encoded,
            "OK content of notes.txt\n..\n...hidden\nplain\n.\n"
        );

        let decoded = Response::decode(&encoded).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_message_newlines_flattened() {
        let response = Response::ok("two\nlines");
        assert_eq!(response.message, "two lines");
    }

    #[test]
    fn test_body_with_embedded_newline_stays_framed() {
        let response = Response::ok_with_body("x", vec!["a\n.\nb".to_string()]);
        let decoded = Response::decode(&response.encode()).unwrap();
        assert_eq!(decoded.body, vec!["a", ".", "b"]);
    }

    #[test]
    fn test_decoder_incremental() {
        let mut decoder = ResponseDecoder::new();
        assert_eq!(decoder.push_line("ERR AUTH authentication required\r\n").unwrap(), None);
        let response = decoder.push_line(".\r\n").unwrap().unwrap();
        assert_eq!(response.status, Status::Err);
        assert_eq!(response.code, Some(ErrorCode::Auth));
        assert_eq!(response.message, "authentication required");

        // The decoder is ready for the next unit.
        assert_eq!(decoder.push_line("OK Goodbye").unwrap(), None);
        assert!(decoder.push_line(".").unwrap().unwrap().is_ok());
    }

    #[test]
    fn test_decode_rejects_unknown_status() {
        let err = Response::decode("MAYBE hi\n.\n").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedResponse(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_code() {
        let err = Response::decode("ERR WHAT hi\n.\n").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedResponse(_)));
    }

    #[test]
    fn test_decode_requires_terminator() {
        let err = Response::decode("OK listing\nline\n").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedResponse(_)));
    }

    #[test]
    fn test_error_code_tokens() {
        for code in [
            ErrorCode::Protocol,
            ErrorCode::Auth,
            ErrorCode::Escape,
            ErrorCode::NotFound,
            ErrorCode::NotAFile,
            ErrorCode::Io,
        ] {
            assert_eq!(ErrorCode::from_token(code.as_str()), Some(code));
        }
    }
}
