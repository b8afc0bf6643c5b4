//! Request dispatch.
//!
//! [`CommandDispatcher`] turns one request line into one [`Response`] for a
//! given [`Session`]. It knows nothing about sockets; the listener feeds it
//! lines and writes back whatever it returns.
//!
//! Routing follows the session phase:
//! - pre-auth verbs (`SUBMIT-USERNAME`, `SUBMIT-PASSWORD`, `TERMINATE`) are
//!   accepted in every phase
//! - post-auth verbs require an authenticated session and are refused with
//!   `ERR AUTH` otherwise, before their arguments are even looked at

use std::sync::Arc;

use protocol::{
    Command, Delimiter, ErrorCode, ProtocolError, Response, Verb, POST_AUTH_VERBS, PRE_AUTH_VERBS,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialStore;
use crate::files::{FileOpError, FileOperations};
use crate::sandbox::SandboxError;
use crate::session::{AuthError, LoginRegistry, Session};

/// Errors raised while handling a single request.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Malformed request line or wrong argument count.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Verb not routed in the session's current phase.
    #[error("unknown verb {token}; valid verbs: {}", verb_list(.valid))]
    UnknownVerb {
        token: String,
        valid: &'static [Verb],
    },

    /// Login state machine refusal.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// File operation failure.
    #[error(transparent)]
    File(#[from] FileOpError),
}

impl CommandError {
    /// Wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::Protocol(_) | CommandError::UnknownVerb { .. } => ErrorCode::Protocol,
            CommandError::Auth(AuthError::Store(_)) => ErrorCode::Io,
            CommandError::Auth(_) => ErrorCode::Auth,
            CommandError::File(e) => match e {
                FileOpError::Sandbox(SandboxError::Escape) => ErrorCode::Escape,
                FileOpError::Sandbox(SandboxError::InvalidPath) => ErrorCode::Protocol,
                FileOpError::Sandbox(SandboxError::RootUnavailable { .. }) => ErrorCode::Io,
                FileOpError::NotFound(_) => ErrorCode::NotFound,
                FileOpError::NotAFile(_)
                | FileOpError::NotADirectory(_)
                | FileOpError::DestinationIsDirectory(_) => ErrorCode::NotAFile,
                FileOpError::FileTooLarge { .. } | FileOpError::InvalidPayload => {
                    ErrorCode::Protocol
                }
                FileOpError::Io { .. } => ErrorCode::Io,
            },
        }
    }

    /// Convert to a client-safe response.
    ///
    /// I/O failures get a generic message; their detail only goes to the
    /// server log.
    pub fn to_response(&self) -> Response {
        let message = match self {
            CommandError::Protocol(ProtocolError::WrongArgumentCount { verb, .. }) => {
                match Verb::from_token(verb) {
                    Some(v) => format!("{}; usage: {}", self, v.usage()),
                    None => self.to_string(),
                }
            }
            CommandError::Auth(AuthError::Store(_)) => "credential store unavailable".to_string(),
            CommandError::File(FileOpError::Io { op, .. }) => format!("{} failed", op),
            CommandError::File(FileOpError::Sandbox(SandboxError::RootUnavailable { .. })) => {
                "server root unavailable".to_string()
            }
            other => other.to_string(),
        };
        Response::error(self.code(), message)
    }
}

fn verb_list(verbs: &[Verb]) -> String {
    verbs
        .iter()
        .map(|v| v.canonical())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Outcome of dispatching one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Response to write back.
    pub response: Response,
    /// Close the connection once the response is written.
    pub close: bool,
}

impl Dispatch {
    fn reply(response: Response) -> Self {
        Self {
            response,
            close: false,
        }
    }
}

/// Transport-agnostic request handler shared by all connections.
pub struct CommandDispatcher {
    store: Arc<dyn CredentialStore>,
    registry: LoginRegistry,
    files: FileOperations,
    delimiter: Delimiter,
}

impl CommandDispatcher {
    /// Create a new dispatcher with the given dependencies.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        registry: LoginRegistry,
        files: FileOperations,
        delimiter: Delimiter,
    ) -> Self {
        Self {
            store,
            registry,
            files,
            delimiter,
        }
    }

    /// Argument delimiter in use.
    pub fn delimiter(&self) -> Delimiter {
        self.delimiter
    }

    /// File operations, and through them the sandbox.
    pub fn files(&self) -> &FileOperations {
        &self.files
    }

    /// Login registry shared by all sessions.
    pub fn registry(&self) -> &LoginRegistry {
        &self.registry
    }

    /// Create a session for a freshly accepted connection.
    pub fn new_session(&self) -> Session {
        Session::new(self.files.sandbox().root())
    }

    /// Handle one request line.
    pub fn dispatch(&self, session: &mut Session, line: &str) -> Dispatch {
        let command = match Command::parse(line, self.delimiter) {
            Ok(command) => command,
            Err(e) => return self.fail(session, None, e.into()),
        };

        let verb = match command.verb() {
            Ok(verb) => verb,
            Err(_) => {
                let valid = if session.is_authenticated() {
                    POST_AUTH_VERBS
                } else {
                    PRE_AUTH_VERBS
                };
                let err = CommandError::UnknownVerb {
                    token: command.token.clone(),
                    valid,
                };
                return self.fail(session, None, err);
            }
        };

        if !verb.is_pre_auth() && !session.is_authenticated() {
            return self.fail(session, Some(verb), AuthError::AuthenticationRequired.into());
        }

        if let Err(e) = command.check_arity(verb) {
            return self.fail(session, Some(verb), e.into());
        }

        debug!(connection_id = %session.id(), verb = %verb, "Dispatching request");

        if verb == Verb::Terminate {
            session.terminate();
            info!(connection_id = %session.id(), "Session terminated by client");
            return Dispatch {
                response: Response::ok("Goodbye"),
                close: true,
            };
        }

        match self.handle(session, verb, &command.args) {
            Ok(response) => Dispatch::reply(response),
            Err(e) => self.fail(session, Some(verb), e),
        }
    }

    fn handle(
        &self,
        session: &mut Session,
        verb: Verb,
        args: &[String],
    ) -> Result<Response, CommandError> {
        let cwd = session.working_directory().to_path_buf();

        let response = match verb {
            Verb::SubmitUsername => {
                session.submit_username(self.store.as_ref(), &args[0])?;
                Response::ok("User accepted, send password")
            }
            Verb::SubmitPassword => {
                session.submit_password(
                    self.store.as_ref(),
                    &self.registry,
                    &args[0],
                    self.files.sandbox().root(),
                )?;
                let user = session.require_authenticated()?;
                info!(connection_id = %session.id(), user = %user, "User logged in");
                Response::ok(format!("Welcome {}", user))
            }
            Verb::SetDir => {
                let dir = self.files.set_directory(&cwd, &args[0])?;
                let shown = self.files.pwd(&dir);
                session.set_working_directory(dir);
                Response::ok(format!("working directory is {}", shown))
            }
            Verb::Pwd => Response::ok(format!("working directory is {}", self.files.pwd(&cwd))),
            Verb::View => {
                let view = self.files.view(&cwd, &args[0])?;
                Response::ok_with_body(view.message(), view.into_body())
            }
            Verb::Copy => {
                let outcome = self.files.copy(&cwd, &args[0], &args[1])?;
                Response::ok(format!(
                    "copied {} to {} ({} bytes)",
                    outcome.source, outcome.destination, outcome.bytes
                ))
            }
            Verb::Move => {
                let outcome = self.files.move_file(&cwd, &args[0], &args[1])?;
                Response::ok(format!(
                    "moved {} to {}",
                    outcome.source, outcome.destination
                ))
            }
            Verb::Rename => {
                let outcome = self.files.rename(&cwd, &args[0], &args[1])?;
                Response::ok(format!(
                    "renamed {} to {}",
                    outcome.source, outcome.destination
                ))
            }
            Verb::Download => {
                let download = self.files.download(&cwd, &args[0])?;
                Response::ok_with_body(
                    format!(
                        "{} {} bytes sha256 {}",
                        download.path, download.size, download.sha256
                    ),
                    download.lines,
                )
            }
            Verb::Upload => {
                let upload = self.files.upload(&cwd, &args[0], &args[1])?;
                Response::ok(format!(
                    "stored {} {} bytes sha256 {}",
                    upload.path, upload.size, upload.sha256
                ))
            }
            // Handled before argument routing.
            Verb::Terminate => Response::ok("Goodbye"),
        };

        Ok(response)
    }

    fn fail(&self, session: &Session, verb: Option<Verb>, err: CommandError) -> Dispatch {
        let verb = verb.map(Verb::canonical).unwrap_or("-");
        let user = session.authenticated_user().unwrap_or("-");

        match &err {
            CommandError::File(FileOpError::Sandbox(SandboxError::Escape)) => {
                warn!(
                    connection_id = %session.id(),
                    user = %user,
                    verb = %verb,
                    "Path escape attempt refused"
                );
            }
            CommandError::File(FileOpError::Io { .. })
            | CommandError::File(FileOpError::Sandbox(SandboxError::RootUnavailable { .. }))
            | CommandError::Auth(AuthError::Store(_)) => {
                error!(
                    connection_id = %session.id(),
                    user = %user,
                    verb = %verb,
                    error = %err,
                    "Request failed"
                );
            }
            _ => {
                debug!(
                    connection_id = %session.id(),
                    user = %user,
                    verb = %verb,
                    error = %err,
                    "Request refused"
                );
            }
        }

        Dispatch::reply(err.to_response())
    }
}
