//! Request-line parsing.
//!
//! A request is a single line: a verb followed by its arguments. How the
//! arguments are separated is fixed per deployment by [`Delimiter`].

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Field separator used in the pipe convention.
pub const PIPE_SEPARATOR: char = '|';

/// Argument delimiter convention for request lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    /// Tokens are separated by runs of whitespace.
    #[default]
    Whitespace,
    /// Fields are separated by `|` and trimmed, so arguments may contain spaces.
    Pipe,
}

impl Delimiter {
    /// Split a request line into its non-empty fields.
    pub fn split(self, line: &str) -> Vec<&str> {
        match self {
            Delimiter::Whitespace => line.split_whitespace().collect(),
            Delimiter::Pipe => line
                .split(PIPE_SEPARATOR)
                .map(str::trim)
                .filter(|field| !field.is_empty())
                .collect(),
        }
    }

    /// Separator written between fields when rendering a request.
    fn join_separator(self) -> &'static str {
        match self {
            Delimiter::Whitespace => " ",
            Delimiter::Pipe => " | ",
        }
    }

    /// Check that an argument survives a round trip through this delimiter.
    fn can_encode(self, arg: &str) -> bool {
        if arg.is_empty() || arg.contains(['\r', '\n']) {
            return false;
        }
        match self {
            Delimiter::Whitespace => !arg.chars().any(char::is_whitespace),
            Delimiter::Pipe => !arg.contains(PIPE_SEPARATOR) && arg.trim() == arg,
        }
    }
}

/// Every verb the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Stage a username for the two-phase login.
    SubmitUsername,
    /// Complete the login for the staged username.
    SubmitPassword,
    /// Close the session.
    Terminate,
    /// Change (and create if needed) the working directory.
    SetDir,
    /// List a directory or show the head of a file.
    View,
    /// Copy a regular file.
    Copy,
    /// Move a regular file.
    Move,
    /// Rename a file relative to its own parent.
    Rename,
    /// Report the working directory.
    Pwd,
    /// Fetch a whole file as base64 body lines.
    Download,
    /// Store a base64 payload as a file.
    Upload,
}

/// Verbs accepted before authentication.
pub const PRE_AUTH_VERBS: &[Verb] = &[Verb::SubmitUsername, Verb::SubmitPassword, Verb::Terminate];

/// Verbs accepted once authenticated.
pub const POST_AUTH_VERBS: &[Verb] = &[
    Verb::SetDir,
    Verb::View,
    Verb::Copy,
    Verb::Move,
    Verb::Rename,
    Verb::Pwd,
    Verb::Download,
    Verb::Upload,
    Verb::Terminate,
];

impl Verb {
    /// Look up a verb token, case-insensitively.
    ///
    /// Legacy spellings (`USER`, `PASS`, `QUIT`, `SET-FOLDER`, ...) map onto
    /// the canonical verbs.
    pub fn from_token(token: &str) -> Option<Self> {
        let verb = match token.to_ascii_uppercase().as_str() {
            "SUBMIT-USERNAME" | "USER" | "UNAME" => Verb::SubmitUsername,
            "SUBMIT-PASSWORD" | "PASS" => Verb::SubmitPassword,
            "TERMINATE" | "QUIT" | "EXIT" => Verb::Terminate,
            "SET-DIR" | "SET-FOLDER" | "SS_DIR" | "CD" => Verb::SetDir,
            "VIEW" => Verb::View,
            "COPY" => Verb::Copy,
            "MOVE" => Verb::Move,
            "RENAME" => Verb::Rename,
            "PWD" => Verb::Pwd,
            "DOWNLOAD" => Verb::Download,
            "UPLOAD" => Verb::Upload,
            _ => return None,
        };
        Some(verb)
    }

    /// Canonical wire spelling.
    pub fn canonical(self) -> &'static str {
        match self {
            Verb::SubmitUsername => "SUBMIT-USERNAME",
            Verb::SubmitPassword => "SUBMIT-PASSWORD",
            Verb::Terminate => "TERMINATE",
            Verb::SetDir => "SET-DIR",
            Verb::View => "VIEW",
            Verb::Copy => "COPY",
            Verb::Move => "MOVE",
            Verb::Rename => "RENAME",
            Verb::Pwd => "PWD",
            Verb::Download => "DOWNLOAD",
            Verb::Upload => "UPLOAD",
        }
    }

    /// Exact number of arguments the verb takes.
    pub fn arity(self) -> usize {
        match self {
            Verb::Terminate | Verb::Pwd => 0,
            Verb::SubmitUsername
            | Verb::SubmitPassword
            | Verb::SetDir
            | Verb::View
            | Verb::Download => 1,
            Verb::Copy | Verb::Move | Verb::Rename | Verb::Upload => 2,
        }
    }

    /// Usage string shown in protocol errors.
    pub fn usage(self) -> &'static str {
        match self {
            Verb::SubmitUsername => "SUBMIT-USERNAME <name>",
            Verb::SubmitPassword => "SUBMIT-PASSWORD <secret>",
            Verb::Terminate => "TERMINATE",
            Verb::SetDir => "SET-DIR <path>",
            Verb::View => "VIEW <path>",
            Verb::Copy => "COPY <src> <dst>",
            Verb::Move => "MOVE <src> <dst>",
            Verb::Rename => "RENAME <src> <newName>",
            Verb::Pwd => "PWD",
            Verb::Download => "DOWNLOAD <path>",
            Verb::Upload => "UPLOAD <path> <base64>",
        }
    }

    /// Whether the verb is routed in the pre-authentication table.
    pub fn is_pre_auth(self) -> bool {
        PRE_AUTH_VERBS.contains(&self)
    }

    /// Whether the verb is routed in the post-authentication table.
    pub fn is_post_auth(self) -> bool {
        POST_AUTH_VERBS.contains(&self)
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.canonical())
    }
}

/// One parsed request. Lives for a single exchange only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Verb token as received, uppercased.
    pub token: String,
    /// Arguments in order.
    pub args: Vec<String>,
}

impl Command {
    /// Build a command for a known verb.
    pub fn new<I, S>(verb: Verb, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            token: verb.canonical().to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse one request line.
    pub fn parse(line: &str, delimiter: Delimiter) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut fields = delimiter.split(line).into_iter();

        let verb_field = fields.next().ok_or(ProtocolError::EmptyRequest)?;
        let token = match delimiter {
            Delimiter::Whitespace => verb_field.to_ascii_uppercase(),
            // "SET FOLDER | x" is the legacy spelling of SET-FOLDER.
            Delimiter::Pipe => verb_field
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("-")
                .to_ascii_uppercase(),
        };

        Ok(Self {
            token,
            args: fields.map(str::to_string).collect(),
        })
    }

    /// Resolve the token to a known verb.
    pub fn verb(&self) -> Result<Verb> {
        Verb::from_token(&self.token).ok_or_else(|| ProtocolError::UnknownVerb(self.token.clone()))
    }

    /// Check the argument count against the verb's arity.
    pub fn check_arity(&self, verb: Verb) -> Result<()> {
        if self.args.len() != verb.arity() {
            return Err(ProtocolError::WrongArgumentCount {
                verb: verb.canonical(),
                expected: verb.arity(),
                got: self.args.len(),
            });
        }
        Ok(())
    }

    /// Render the command as a request line (without the newline).
    pub fn to_line(&self, delimiter: Delimiter) -> Result<String> {
        if let Some(bad) = self.args.iter().find(|arg| !delimiter.can_encode(arg)) {
            return Err(ProtocolError::UnencodableArgument(bad.clone()));
        }
        let mut fields = Vec::with_capacity(self.args.len() + 1);
        fields.push(self.token.as_str());
        fields.extend(self.args.iter().map(String::as_str));
        Ok(fields.join(delimiter.join_separator()))
    }
}
