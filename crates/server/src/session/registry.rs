//! Process-wide set of logged-in usernames.
//!
//! Consulted only when a session completes a login. The set lives outside
//! [`Session`](super::Session) so sessions stay single-owner; a session
//! holds a [`LoginGuard`] which releases its entry on drop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Tracks which users currently hold an authenticated session.
#[derive(Debug, Clone)]
pub struct LoginRegistry {
    active: Arc<Mutex<HashSet<String>>>,
    allow_concurrent: bool,
}

impl LoginRegistry {
    /// Create a registry.
    ///
    /// With `allow_concurrent` set every login succeeds and nothing is
    /// tracked.
    pub fn new(allow_concurrent: bool) -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
            allow_concurrent,
        }
    }

    /// Claim `username` for one session.
    ///
    /// Returns `None` if another session already holds it.
    pub fn try_acquire(&self, username: &str) -> Option<LoginGuard> {
        if self.allow_concurrent {
            return Some(LoginGuard {
                active: None,
                username: username.to_string(),
            });
        }

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(username.to_string()) {
            return None;
        }

        Some(LoginGuard {
            active: Some(Arc::clone(&self.active)),
            username: username.to_string(),
        })
    }

    /// Whether `username` is currently logged in somewhere.
    pub fn is_active(&self, username: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(username)
    }

    /// Number of tracked logins.
    pub fn len(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no login is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LoginRegistry {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Releases a username from the registry when dropped.
#[derive(Debug)]
pub struct LoginGuard {
    active: Option<Arc<Mutex<HashSet<String>>>>,
    username: String,
}

impl LoginGuard {
    /// The claimed username.
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Drop for LoginGuard {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.username);
            tracing::debug!(user = %self.username, "Login released");
        }
    }
}
