//! SQLite-backed credential store.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use super::{
    check_password, hash_password, validate_username, CredentialError, CredentialResult,
    CredentialStore,
};

/// Current schema version.
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// A user as listed by [`SqliteCredentialStore::list_users`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Login name.
    pub username: String,
    /// Unix timestamp when the user was created.
    pub created_at: i64,
}

/// Persistent user table.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /// Open or create the user database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> CredentialResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CredentialError::InvalidPath(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> CredentialResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> CredentialResult<Self> {
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> CredentialResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CredentialError::Poisoned)
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> CredentialResult<i32> {
        let conn = self.lock()?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    /// Add a user with the given password.
    pub fn add_user(&self, username: &str, password: &str) -> CredentialResult<()> {
        validate_username(username)?;
        if password.is_empty() {
            return Err(CredentialError::EmptyPassword);
        }

        let (salt, hash) = hash_password(password);
        let conn = self.lock()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO users (username, salt, password_hash, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![username, salt, hash, unix_now()],
        )?;

        if inserted == 0 {
            return Err(CredentialError::UserExists(username.to_string()));
        }

        tracing::info!(user = %username, "User added");
        Ok(())
    }

    /// Remove a user. Returns whether the user existed.
    pub fn remove_user(&self, username: &str) -> CredentialResult<bool> {
        let conn = self.lock()?;
        let rows_affected =
            conn.execute("DELETE FROM users WHERE username = ?1", params![username])?;
        if rows_affected > 0 {
            tracing::info!(user = %username, "User removed");
        }
        Ok(rows_affected > 0)
    }

    /// List all users ordered by name.
    pub fn list_users(&self) -> CredentialResult<Vec<UserRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT username, created_at FROM users ORDER BY username ASC")?;

        let users = stmt
            .query_map([], |row| {
                Ok(UserRecord {
                    username: row.get(0)?,
                    created_at: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(users)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn exists(&self, username: &str) -> CredentialResult<bool> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                params![username],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn verify(&self, username: &str, password: &str) -> CredentialResult<bool> {
        let stored: Option<(String, String)> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT salt, password_hash FROM users WHERE username = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        match stored {
            Some((salt, hash)) => check_password(username, password, &salt, &hash),
            None => Ok(false),
        }
    }
}

/// Run all pending migrations.
fn run_migrations(conn: &mut Connection) -> CredentialResult<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration to version 1: users table.
fn migrate_v1(conn: &mut Connection) -> CredentialResult<()> {
    let tx = conn.transaction()?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            username TEXT PRIMARY KEY,
            salt TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    tx.execute(
        &format!("PRAGMA user_version = {}", CURRENT_SCHEMA_VERSION),
        [],
    )?;

    tx.commit()?;
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
