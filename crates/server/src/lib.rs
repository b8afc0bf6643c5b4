//! # FsGate Server Library
//!
//! This crate provides the FsGate server: a line-protocol service that lets
//! authenticated users browse and manage files confined to one server
//! directory.
//!
//! ## Overview
//!
//! - **Sessions**: two-phase login (username, then password) tracked per
//!   connection
//! - **Credentials**: SQLite-backed user store with salted password hashes
//! - **File Operations**: view, copy, move, rename, working directory
//!   changes and base64 transfers, all confined to the server root
//! - **Transport**: TCP listener with one worker per connection and
//!   graceful shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  ConnectionListener                      │
//! │        (one worker task + one Session per connection)    │
//! ├──────────────────────────────────────────────────────────┤
//! │                  CommandDispatcher                       │
//! │  parse ─► phase check ─► arity ─► handler ─► Response    │
//! ├───────────────────┬──────────────────┬───────────────────┤
//! │  CredentialStore  │  LoginRegistry   │  FileOperations   │
//! │                   │                  │   └─ PathSandbox  │
//! └───────────────────┴──────────────────┴───────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use server::credentials::MemoryCredentialStore;
//! use server::files::{FileLimits, FileOperations};
//! use server::sandbox::{PathSandbox, ServerRoot};
//! use server::session::LoginRegistry;
//! use server::CommandDispatcher;
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = MemoryCredentialStore::with_users([("alice", "secret")])?;
//!     let root = ServerRoot::new("/srv/fsgate")?;
//!     let files = FileOperations::new(PathSandbox::new(root), FileLimits::default());
//!     let dispatcher = CommandDispatcher::new(
//!         Arc::new(store),
//!         LoginRegistry::default(),
//!         files,
//!         protocol::Delimiter::Whitespace,
//!     );
//!
//!     let mut session = dispatcher.new_session();
//!     dispatcher.dispatch(&mut session, "USER alice");
//!     let reply = dispatcher.dispatch(&mut session, "PASS secret");
//!     assert!(reply.response.is_ok());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`credentials`]: User credential stores
//! - [`sandbox`]: Server root and path confinement
//! - [`session`]: Per-connection session state and the login registry
//! - [`files`]: File operations
//! - [`dispatcher`]: Request handling
//! - [`net`]: TCP listener and client

pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod files;
pub mod net;
pub mod sandbox;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use credentials::{
    CredentialError, CredentialStore, MemoryCredentialStore, SqliteCredentialStore,
};
pub use dispatcher::{CommandDispatcher, CommandError, Dispatch};
pub use files::{FileLimits, FileOpError, FileOperations};
pub use net::{ClientError, ConnectionLimits, ConnectionListener, FsClient};
pub use sandbox::{PathSandbox, SandboxError, ServerRoot};
pub use session::{AuthError, LoginRegistry, Phase, Session};
