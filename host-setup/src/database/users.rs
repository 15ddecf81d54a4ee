// User directory bootstrap: the `users` table and its first rows
//
// Username and email are stored lowercased and checked for duplicates *before* the insert so a
// conflict can be reported per field; the table's UNIQUE constraints remain as a backstop.

use anyhow::Result;
use log::{debug, info};
use std::fmt;

use crate::database::connection::DbSession;
use crate::security::password::hash_password;

pub const USERS_TABLE: &str = "users";
/// Column widths of `users.username` and `users.email`.
pub const USERNAME_MAX_LEN: usize = 50;
pub const EMAIL_MAX_LEN: usize = 100;

/// Which uniqueness rule a new user violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    DuplicateBoth,
    DuplicateUsername,
    DuplicateEmail,
}

impl ConflictKind {
    pub fn classify(username_taken: bool, email_taken: bool) -> Option<Self> {
        match (username_taken, email_taken) {
            (true, true) => Some(ConflictKind::DuplicateBoth),
            (true, false) => Some(ConflictKind::DuplicateUsername),
            (false, true) => Some(ConflictKind::DuplicateEmail),
            (false, false) => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ConflictKind::DuplicateBoth => "ERR-USR-001",
            ConflictKind::DuplicateUsername => "ERR-USR-002",
            ConflictKind::DuplicateEmail => "ERR-USR-003",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ConflictKind::DuplicateBoth => "Username and Email are already in use.",
            ConflictKind::DuplicateUsername => "Username is already in use.",
            ConflictKind::DuplicateEmail => "Email is already in use.",
        }
    }

    pub fn username_conflicts(&self) -> bool {
        matches!(
            self,
            ConflictKind::DuplicateBoth | ConflictKind::DuplicateUsername
        )
    }

    pub fn email_conflicts(&self) -> bool {
        matches!(self, ConflictKind::DuplicateBoth | ConflictKind::DuplicateEmail)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UserDirectoryError {
    #[error("{}", .0.message())]
    Conflict(ConflictKind),
    #[error("An email address is required")]
    MissingEmail,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A user as requested by the caller; normalized by `UserDirectory::insert_user`.
#[derive(Clone)]
pub struct NewUser {
    pub username: Option<String>,
    pub email: String,
    pub password: Option<String>,
    pub is_admin: bool,
    pub is_active: bool,
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("is_admin", &self.is_admin)
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// The row actually written: normalized names and a password hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub username: Option<String>,
    pub email: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub is_active: bool,
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

pub struct UserDirectory {
    schema: String,
}

impl UserDirectory {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }

    /// Create the users table when missing. Returns `true` if it was created by this call.
    pub async fn ensure_user_table_exists(&self, session: &mut dyn DbSession) -> Result<bool> {
        if session.table_exists(&self.schema, USERS_TABLE).await? {
            debug!("[PHASE: users] [STEP: table] Users table already present");
            return Ok(false);
        }
        session.create_users_table(&self.schema).await?;
        info!(
            "[PHASE: users] [STEP: table] Created table {}.{}",
            self.schema, USERS_TABLE
        );
        Ok(true)
    }

    /// Insert a user after checking username and email independently.
    ///
    /// Without a password the stored hash is empty and the user is never active.
    pub async fn insert_user(
        &self,
        session: &mut dyn DbSession,
        user: &NewUser,
    ) -> Result<i64, UserDirectoryError> {
        let username = user
            .username
            .as_deref()
            .map(normalize)
            .filter(|u| !u.is_empty());
        let email = normalize(&user.email);
        if email.is_empty() {
            return Err(UserDirectoryError::MissingEmail);
        }

        let username_taken = match username.as_deref() {
            Some(name) => session
                .find_user_by_username(&self.schema, name)
                .await?
                .is_some(),
            None => false,
        };
        let email_taken = session
            .find_user_by_email(&self.schema, &email)
            .await?
            .is_some();
        if let Some(kind) = ConflictKind::classify(username_taken, email_taken) {
            return Err(UserDirectoryError::Conflict(kind));
        }

        let (password_hash, is_active) = match user.password.as_deref() {
            Some(secret) if !secret.is_empty() => (hash_password(secret)?, user.is_active),
            _ => (String::new(), false),
        };

        let row = UserRow {
            username,
            email,
            password_hash,
            is_admin: user.is_admin,
            is_active,
        };
        let id = session.insert_user(&self.schema, &row).await?;
        info!(
            "[PHASE: users] [STEP: insert] Inserted user id={} (admin={}, active={})",
            id, row.is_admin, row.is_active
        );
        Ok(id)
    }

    /// Whether any row has `is_admin = TRUE`. A missing table means no admin.
    pub async fn admin_exists(&self, session: &mut dyn DbSession) -> Result<bool> {
        if !session.table_exists(&self.schema, USERS_TABLE).await? {
            return Ok(false);
        }
        session.admin_user_exists(&self.schema).await
    }
}
