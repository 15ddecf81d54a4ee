// Orchestrator-level error taxonomy

use crate::database::connection::ConnectError;
use crate::database::users::ConflictKind;
use crate::security::marker_store::MarkerError;
use crate::setup::events::FormField;
use crate::setup::storage::{CredentialFileError, StorageError};

/// Which of the re-typed passwords differ from the first entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordMismatch {
    Both,
    ServiceRole,
    Superuser,
}

impl PasswordMismatch {
    pub fn classify(service_matches: bool, superuser_matches: bool) -> Option<Self> {
        match (service_matches, superuser_matches) {
            (false, false) => Some(PasswordMismatch::Both),
            (false, true) => Some(PasswordMismatch::ServiceRole),
            (true, false) => Some(PasswordMismatch::Superuser),
            (true, true) => None,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            PasswordMismatch::Both => "Both passwords do not match",
            PasswordMismatch::ServiceRole => "Service role password does not match",
            PasswordMismatch::Superuser => "Superuser password does not match",
        }
    }

    pub fn service_role_mismatched(&self) -> bool {
        matches!(self, PasswordMismatch::Both | PasswordMismatch::ServiceRole)
    }

    pub fn superuser_mismatched(&self) -> bool {
        matches!(self, PasswordMismatch::Both | PasswordMismatch::Superuser)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("All fields are required.")]
    MissingFields(Vec<FormField>),
    #[error("Invalid email address. Please enter a valid email.")]
    InvalidEmail,
    #[error("Username must be at most {max} characters.")]
    UsernameTooLong { max: usize },
    #[error("Email must be at most {max} characters.")]
    EmailTooLong { max: usize },
    #[error("{}", .0.message())]
    PasswordMismatch(PasswordMismatch),
    #[error("{0}")]
    CredentialFile(CredentialFileError),
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("{0}")]
    Connectivity(ConnectError),
    #[error("ODDM Toolkit database already exists. Invalid password provided.")]
    AlreadyProvisioned,
    #[error("The ODDM service role already exists with a different password.")]
    ServiceRoleRejected,
    #[error("{}", .0.message())]
    DirectoryConflict(ConflictKind),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    StorageAccess(StorageError),
    #[error("Setup could not be saved: {0}")]
    Persistence(#[source] MarkerError),
    #[error("{message}")]
    Fatal {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl SetupError {
    pub fn fatal(message: impl Into<String>, source: anyhow::Error) -> Self {
        SetupError::Fatal {
            message: message.into(),
            source,
        }
    }

    /// Legacy code, for logs only.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            SetupError::AlreadyProvisioned => Some("ERR-ODDM-STUP-001"),
            SetupError::ServiceRoleRejected => Some("ERR-ODDM-STUP-002"),
            SetupError::DirectoryConflict(kind) => Some(kind.code()),
            _ => None,
        }
    }

    /// Fields the operator has to correct.
    pub fn fields(&self) -> Vec<FormField> {
        match self {
            SetupError::Connectivity(_) => vec![FormField::AdminPassword],
            SetupError::AlreadyProvisioned | SetupError::ServiceRoleRejected => {
                vec![FormField::ServicePassword]
            }
            SetupError::DirectoryConflict(kind) => {
                let mut fields = Vec::new();
                if kind.username_conflicts() {
                    fields.push(FormField::Username);
                }
                if kind.email_conflicts() {
                    fields.push(FormField::Email);
                }
                fields
            }
            SetupError::Validation(v) => match v {
                ValidationError::MissingFields(fields) => fields.clone(),
                ValidationError::InvalidEmail | ValidationError::EmailTooLong { .. } => {
                    vec![FormField::Email]
                }
                ValidationError::UsernameTooLong { .. } => vec![FormField::Username],
                ValidationError::PasswordMismatch(kind) => {
                    let mut fields = Vec::new();
                    if kind.service_role_mismatched() {
                        fields.push(FormField::ServicePassword);
                    }
                    if kind.superuser_mismatched() {
                        fields.push(FormField::SuperuserPassword);
                    }
                    fields
                }
                ValidationError::CredentialFile(_) => vec![FormField::CredentialFile],
            },
            SetupError::StorageAccess(e) => match e {
                StorageError::EmptyPath | StorageError::LocalPath { .. } => {
                    vec![FormField::LocalPath]
                }
                StorageError::MissingFolderId | StorageError::InvalidFolderId => {
                    vec![FormField::FolderId]
                }
                StorageError::RemoteFolder { .. } => {
                    vec![FormField::FolderId, FormField::CredentialFile]
                }
            },
            SetupError::Persistence(_) | SetupError::Fatal { .. } => Vec::new(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SetupError::Persistence(_) | SetupError::Fatal { .. })
    }

    /// Details for the log file; may be more specific than the operator message.
    pub fn log_details(&self) -> String {
        match self {
            SetupError::Connectivity(e) => e.internal_details.clone(),
            SetupError::StorageAccess(StorageError::RemoteFolder {
                internal_details, ..
            }) => internal_details.clone(),
            SetupError::Fatal { message, source } => format!("{}: {:#}", message, source),
            other => other.to_string(),
        }
    }
}
