//! Per-connection session state.
//!
//! A [`Session`] is created when a connection is accepted and is owned by
//! that connection's worker alone. It walks the two-phase login:
//!
//! ```text
//! UNAUTHENTICATED --username ok--> AWAITING_PASSWORD --password ok--> AUTHENTICATED
//!        ^                                |
//!        +------- wrong password ---------+
//!
//! any phase --terminate--> CLOSED
//! ```

mod registry;

pub use registry::{LoginGuard, LoginRegistry};

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use crate::credentials::{CredentialError, CredentialStore};

/// Opaque identifier of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first group is plenty to tell connections apart in logs.
        let id = self.0.to_string();
        f.write_str(&id[..8])
    }
}

/// Authentication phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unauthenticated,
    AwaitingPassword,
    Authenticated,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Unauthenticated => "UNAUTHENTICATED",
            Phase::AwaitingPassword => "AWAITING_PASSWORD",
            Phase::Authenticated => "AUTHENTICATED",
            Phase::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Login failures. All are recoverable; the connection stays open.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("User not found")]
    UnknownUser,

    #[error("Wrong password")]
    WrongPassword,

    #[error("username required first")]
    UsernameRequired,

    #[error("already logged in")]
    AlreadyAuthenticated,

    #[error("user {0} is already logged in on another session")]
    LoggedInElsewhere(String),

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("session is closed")]
    SessionClosed,

    /// The credential store failed; reported to clients as an I/O fault.
    #[error("credential store unavailable: {0}")]
    Store(#[from] CredentialError),
}

/// Mutable state of one connection.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    phase: Phase,
    pending_username: Option<String>,
    authenticated_user: Option<String>,
    working_directory: PathBuf,
    login: Option<LoginGuard>,
}

impl Session {
    /// Create an unauthenticated session whose working directory is `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            id: ConnectionId::new(),
            phase: Phase::Unauthenticated,
            pending_username: None,
            authenticated_user: None,
            working_directory: root.to_path_buf(),
            login: None,
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Username staged by the first login step.
    pub fn pending_username(&self) -> Option<&str> {
        self.pending_username.as_deref()
    }

    /// Logged-in user.
    pub fn authenticated_user(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    /// Current working directory (absolute, inside the server root).
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == Phase::Authenticated
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Stage `username` for the password step.
    ///
    /// An unknown username drops any staged name and returns the session
    /// to [`Phase::Unauthenticated`]. A second known username simply
    /// replaces the first.
    pub fn submit_username(
        &mut self,
        store: &dyn CredentialStore,
        username: &str,
    ) -> Result<(), AuthError> {
        match self.phase {
            Phase::Authenticated => return Err(AuthError::AlreadyAuthenticated),
            Phase::Closed => return Err(AuthError::SessionClosed),
            Phase::Unauthenticated | Phase::AwaitingPassword => {}
        }

        if store.exists(username)? {
            self.pending_username = Some(username.to_string());
            self.phase = Phase::AwaitingPassword;
            Ok(())
        } else {
            self.pending_username = None;
            self.phase = Phase::Unauthenticated;
            Err(AuthError::UnknownUser)
        }
    }

    /// Complete the login for the staged username.
    ///
    /// On success the working directory is reset to `root`. Any failure
    /// other than a store fault clears the staged username.
    pub fn submit_password(
        &mut self,
        store: &dyn CredentialStore,
        registry: &LoginRegistry,
        password: &str,
        root: &Path,
    ) -> Result<(), AuthError> {
        match self.phase {
            Phase::Authenticated => return Err(AuthError::AlreadyAuthenticated),
            Phase::Closed => return Err(AuthError::SessionClosed),
            Phase::Unauthenticated => return Err(AuthError::UsernameRequired),
            Phase::AwaitingPassword => {}
        }

        let Some(username) = self.pending_username.clone() else {
            self.phase = Phase::Unauthenticated;
            return Err(AuthError::UsernameRequired);
        };

        if !store.verify(&username, password)? {
            self.reset();
            return Err(AuthError::WrongPassword);
        }

        let Some(guard) = registry.try_acquire(&username) else {
            self.reset();
            return Err(AuthError::LoggedInElsewhere(username));
        };

        self.pending_username = None;
        self.authenticated_user = Some(username);
        self.working_directory = root.to_path_buf();
        self.login = Some(guard);
        self.phase = Phase::Authenticated;
        Ok(())
    }

    /// Close the session and release its login.
    pub fn terminate(&mut self) {
        self.pending_username = None;
        self.authenticated_user = None;
        self.login = None;
        self.phase = Phase::Closed;
    }

    /// Name of the logged-in user, or an error if not authenticated.
    pub fn require_authenticated(&self) -> Result<&str, AuthError> {
        match (self.phase, self.authenticated_user.as_deref()) {
            (Phase::Authenticated, Some(user)) => Ok(user),
            _ => Err(AuthError::AuthenticationRequired),
        }
    }

    /// Replace the working directory.
    ///
    /// Callers pass a path already confined by the sandbox.
    pub(crate) fn set_working_directory(&mut self, path: PathBuf) {
        self.working_directory = path;
    }

    fn reset(&mut self) {
        self.pending_username = None;
        self.phase = Phase::Unauthenticated;
    }
}
