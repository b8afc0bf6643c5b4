//! Path confinement.
//!
//! Every client-supplied path is resolved against the session's working
//! directory and then checked against the [`ServerRoot`]. Resolution is
//! purely lexical: `.` and `..` are folded and repeated separators collapsed
//! without touching the filesystem, so symlinks are not followed here.
//!
//! Both `/` and `\` are accepted as separators. A raw path that starts with
//! a separator is taken relative to the root rather than the working
//! directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// Errors raised while confining a path.
///
/// None of the variants carry the resolved path; messages are safe to
/// show to clients.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The path resolves outside the server root.
    #[error("path escapes the server root")]
    Escape,

    /// The path contains bytes that cannot name a file.
    #[error("path contains invalid characters")]
    InvalidPath,

    /// The root directory could not be prepared at startup.
    #[error("server root {path} is unavailable: {source}")]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The fixed directory all sessions are confined to.
///
/// Canonicalised once at startup and read-only afterwards; clones share
/// the same path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRoot(Arc<Path>);

impl ServerRoot {
    /// Create the directory if missing and canonicalise it.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, SandboxError> {
        let path = path.as_ref();
        let unavailable = |source| SandboxError::RootUnavailable {
            path: path.to_path_buf(),
            source,
        };

        std::fs::create_dir_all(path).map_err(unavailable)?;
        let canonical = path.canonicalize().map_err(unavailable)?;

        tracing::debug!("Server root is {}", canonical.display());
        Ok(Self(Arc::from(canonical)))
    }

    /// The absolute root path.
    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Resolves client paths inside a [`ServerRoot`].
#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: ServerRoot,
}

impl PathSandbox {
    /// Create a sandbox anchored at `root`.
    pub fn new(root: ServerRoot) -> Self {
        Self { root }
    }

    /// The absolute root path.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Whether `path` is the root or a descendant of it.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(self.root())
    }

    /// Resolve `raw` against `cwd` and confine the result to the root.
    ///
    /// `cwd` is checked as well as the result, even though sessions only
    /// ever hold working directories produced by this method.
    pub fn resolve(&self, cwd: &Path, raw: &str) -> Result<PathBuf, SandboxError> {
        if raw.contains('\0') {
            return Err(SandboxError::InvalidPath);
        }
        if !self.contains(cwd) {
            return Err(SandboxError::Escape);
        }

        let absolute_style = raw.starts_with(['/', '\\']);
        let base = if absolute_style { self.root() } else { cwd };

        let mut resolved = normalize(base);
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    resolved.pop();
                }
                name => resolved.push(name),
            }
        }

        if !self.contains(&resolved) {
            return Err(SandboxError::Escape);
        }
        Ok(resolved)
    }

    /// Render a confined path relative to the root, e.g. `/docs/a.txt`.
    ///
    /// Responses use this so the host location of the root never reaches
    /// a client.
    pub fn display(&self, path: &Path) -> String {
        let Ok(relative) = path.strip_prefix(self.root()) else {
            return "/".to_string();
        };

        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        format!("/{}", parts.join("/"))
    }
}

/// Lexically fold `.` and `..` in an absolute path.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
