//! User credential lookup.
//!
//! The session layer only ever asks two questions of a store: does this
//! user exist, and does this password match. [`CredentialStore`] captures
//! exactly that. Two implementations are provided:
//!
//! - [`SqliteCredentialStore`]: persistent store used by the `fsgate` binary
//! - [`MemoryCredentialStore`]: in-process store for tests and embedding
//!
//! Passwords are never stored in clear. Each record keeps a random salt and
//! the SHA-256 digest of `salt || password`, both hex encoded.

mod memory;
mod sqlite;

pub use memory::MemoryCredentialStore;
pub use sqlite::{SqliteCredentialStore, UserRecord};

use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Salt length in bytes.
const SALT_LEN: usize = 16;

/// Errors raised by a credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database path could not be prepared.
    #[error("Invalid database path: {0}")]
    InvalidPath(String),

    /// Attempted to add a user that already exists.
    #[error("user already exists: {0}")]
    UserExists(String),

    /// Username cannot be typed on a request line.
    #[error("invalid username {0:?}: must be non-empty without whitespace or '|'")]
    InvalidUsername(String),

    /// Password must not be empty.
    #[error("password must not be empty")]
    EmptyPassword,

    /// A stored password hash could not be parsed.
    #[error("stored password hash for {0} is malformed")]
    MalformedHash(String),

    /// The store's lock was poisoned by a panicking thread.
    #[error("credential store lock poisoned")]
    Poisoned,
}

/// Result type for credential operations.
pub type CredentialResult<T> = Result<T, CredentialError>;

/// Query interface the session layer authenticates against.
///
/// Implementations must be safe to share between connection workers.
pub trait CredentialStore: Send + Sync {
    /// Whether `username` is a known user.
    fn exists(&self, username: &str) -> CredentialResult<bool>;

    /// Whether `password` is correct for `username`.
    ///
    /// Returns `Ok(false)` for unknown users.
    fn verify(&self, username: &str, password: &str) -> CredentialResult<bool>;
}

/// Check that a username can be submitted on a request line.
pub fn validate_username(username: &str) -> CredentialResult<()> {
    if username.is_empty() || username.chars().any(|c| c.is_whitespace() || c == '|') {
        return Err(CredentialError::InvalidUsername(username.to_string()));
    }
    Ok(())
}

/// Hash a password with a fresh random salt.
///
/// Returns `(salt_hex, hash_hex)`.
pub(crate) fn hash_password(password: &str) -> (String, String) {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = salted_digest(&salt, password);
    (hex::encode(salt), hex::encode(digest))
}

/// Check a password against a stored salt and hash.
pub(crate) fn check_password(
    username: &str,
    password: &str,
    salt_hex: &str,
    hash_hex: &str,
) -> CredentialResult<bool> {
    let salt =
        hex::decode(salt_hex).map_err(|_| CredentialError::MalformedHash(username.to_string()))?;
    let expected =
        hex::decode(hash_hex).map_err(|_| CredentialError::MalformedHash(username.to_string()))?;
    let actual = salted_digest(&salt, password);
    Ok(constant_time_eq(&actual, &expected))
}

fn salted_digest(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_check_password() {
        let (salt, hash) = hash_password("s3cret");
        assert_eq!(salt.len(), SALT_LEN * 2);
        assert_eq!(hash.len(), 64);
        assert!(check_password("alice", "s3cret", &salt, &hash).unwrap());
        assert!(!check_password("alice", "S3cret", &salt, &hash).unwrap());
    }

    #[test]
    fn test_hash_is_salted() {
        let (salt_a, hash_a) = hash_password("same");
        let (salt_b, hash_b) = hash_password("same");
        assert_ne!(salt_a, salt_b);
        assert_ne!(hash_a, hash_b);
    }

    #[test]
    fn test_check_password_malformed_hash() {
        let err = check_password("alice", "pw", "zz", "00").unwrap_err();
        assert!(matches!(err, CredentialError::MalformedHash(user) if user == "alice"));
    }

    #[test]
    fn test_validate_username() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("bob_2").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("pipe|name").is_err());
    }
}
