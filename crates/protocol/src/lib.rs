//! # FsGate Protocol Library
//!
//! This crate defines the line protocol spoken between FsGate clients and
//! the server. It has no I/O of its own; transports feed it lines.
//!
//! ## Overview
//!
//! - **Requests**: one line per request, a verb followed by arguments. The
//!   argument separator is fixed per deployment ([`Delimiter`]).
//! - **Responses**: a status line (`OK ...` / `ERR <CODE> ...`), optional
//!   body lines, and a `.` terminator line ([`Response`]).
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Command, Delimiter, Response, Verb};
//!
//! let cmd = Command::parse("copy a.txt b.txt", Delimiter::Whitespace).unwrap();
//! assert_eq!(cmd.verb().unwrap(), Verb::Copy);
//!
//! let wire = Response::ok_with_body("listing", vec!["[FILE] a.txt 5 bytes".into()]).encode();
//! let decoded = Response::decode(&wire).unwrap();
//! assert_eq!(decoded.body.len(), 1);
//! ```
//!
//! ## Modules
//!
//! - [`command`]: Request parsing and the verb table
//! - [`response`]: Response framing
//! - [`error`]: Error types

pub mod command;
pub mod error;
pub mod response;

pub use command::{Command, Delimiter, Verb, PIPE_SEPARATOR, POST_AUTH_VERBS, PRE_AUTH_VERBS};
pub use error::{ProtocolError, Result};
pub use response::{ErrorCode, Response, ResponseDecoder, Status, TERMINATOR};
