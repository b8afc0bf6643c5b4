//! In-memory credential store.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{
    check_password, hash_password, validate_username, CredentialError, CredentialResult,
    CredentialStore,
};

/// Salted hashes kept in a map. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    users: RwLock<HashMap<String, (String, String)>>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `(username, password)` pairs.
    pub fn with_users<'a, I>(users: I) -> CredentialResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let store = Self::new();
        for (username, password) in users {
            store.add_user(username, password)?;
        }
        Ok(store)
    }

    /// Add a user, replacing any existing password.
    pub fn add_user(&self, username: &str, password: &str) -> CredentialResult<()> {
        validate_username(username)?;
        if password.is_empty() {
            return Err(CredentialError::EmptyPassword);
        }
        let entry = hash_password(password);
        self.users
            .write()
            .map_err(|_| CredentialError::Poisoned)?
            .insert(username.to_string(), entry);
        Ok(())
    }

    /// Remove a user. Returns whether the user existed.
    pub fn remove_user(&self, username: &str) -> CredentialResult<bool> {
        Ok(self
            .users
            .write()
            .map_err(|_| CredentialError::Poisoned)?
            .remove(username)
            .is_some())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn exists(&self, username: &str) -> CredentialResult<bool> {
        Ok(self
            .users
            .read()
            .map_err(|_| CredentialError::Poisoned)?
            .contains_key(username))
    }

    fn verify(&self, username: &str, password: &str) -> CredentialResult<bool> {
        let users = self.users.read().map_err(|_| CredentialError::Poisoned)?;
        match users.get(username) {
            Some((salt, hash)) => check_password(username, password, salt, hash),
            None => Ok(false),
        }
    }
}
