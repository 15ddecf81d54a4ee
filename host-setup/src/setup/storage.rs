// Data storage selection: local data folder plus optional drive backup target
//
// Validation happens before anything touches the file system or the network:
// credential document shape -> folder id shape -> remote folder check -> local folder creation.

use async_trait::async_trait;
use log::{debug, info};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Top-level keys every service-account key file carries.
pub const REQUIRED_SERVICE_ACCOUNT_KEYS: [&str; 11] = [
    "type",
    "project_id",
    "private_key_id",
    "private_key",
    "client_email",
    "client_id",
    "auth_uri",
    "token_uri",
    "auth_provider_x509_cert_url",
    "client_x509_cert_url",
    "universe_domain",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudBackupRequest {
    pub credential_file: PathBuf,
    pub folder_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSelection {
    pub local_path: PathBuf,
    pub cloud: Option<CloudBackupRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialFileError {
    #[error("The selected JSON file could not be read.")]
    Unreadable(String),
    #[error("The selected JSON file is invalid.")]
    InvalidJson,
    #[error("The selected JSON file is missing required keys. missing keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),
    #[error("The selected JSON file is not a service account.")]
    WrongAccountType { found: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Please choose a folder for ODDM data.")]
    EmptyPath,
    #[error("Please enter the Google Drive folder ID.")]
    MissingFolderId,
    #[error("The Google Drive folder ID is not valid.")]
    InvalidFolderId,
    #[error("The data folder could not be created: {}", .path.display())]
    LocalPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{user_message}")]
    RemoteFolder {
        user_message: String,
        internal_details: String,
    },
}

impl StorageError {
    /// Whether the error is about operator input rather than the environment.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            StorageError::EmptyPath | StorageError::MissingFolderId | StorageError::InvalidFolderId
        )
    }
}

/// The fields of a service-account key needed to request an access token.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    pub private_key_id: String,
    pub token_uri: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

/// A credential file that passed validation: the full document plus the parsed key.
#[derive(Clone)]
pub struct ValidatedCredential {
    pub document: Value,
    pub key: ServiceAccountKey,
}

impl fmt::Debug for ValidatedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedCredential")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Confirms that a drive folder exists and is reachable with a service account.
#[async_trait]
pub trait RemoteFolderProbe: Send + Sync {
    async fn check_folder(&self, key: &ServiceAccountKey, folder_id: &str)
        -> Result<(), StorageError>;
}

/// Check the shape of a credential document.
pub fn validate_credential_document(
    raw: &str,
    expected_type: &str,
) -> Result<ValidatedCredential, CredentialFileError> {
    let document: Value =
        serde_json::from_str(raw).map_err(|_| CredentialFileError::InvalidJson)?;
    let Some(object) = document.as_object() else {
        return Err(CredentialFileError::InvalidJson);
    };

    let mut missing: Vec<String> = REQUIRED_SERVICE_ACCOUNT_KEYS
        .iter()
        .filter(|k| !object.contains_key(**k))
        .map(|k| k.to_string())
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(CredentialFileError::MissingKeys(missing));
    }

    let found = object
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if found != expected_type {
        return Err(CredentialFileError::WrongAccountType {
            found: found.to_string(),
        });
    }

    let key: ServiceAccountKey =
        serde_json::from_value(document.clone()).map_err(|_| CredentialFileError::InvalidJson)?;
    Ok(ValidatedCredential { document, key })
}

/// Read and validate a credential file from disk.
pub async fn validate_credential_file(
    path: &Path,
    expected_type: &str,
) -> Result<ValidatedCredential, CredentialFileError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CredentialFileError::Unreadable(format!("{:?}: {}", path, e)))?;
    let validated = validate_credential_document(&raw, expected_type)?;
    debug!(
        "[PHASE: storage] [STEP: credential_file] Credential file accepted (key id={})",
        crate::utils::logging::mask_sensitive(&validated.key.private_key_id)
    );
    Ok(validated)
}

fn folder_id_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").ok()).as_ref()
}

/// Drive folder ids are URL-safe tokens; anything else is rejected before a request is built.
pub fn validate_folder_id(folder_id: &str) -> Result<&str, StorageError> {
    let id = folder_id.trim();
    if id.is_empty() {
        return Err(StorageError::MissingFolderId);
    }
    if !folder_id_regex().is_some_and(|re| re.is_match(id)) {
        return Err(StorageError::InvalidFolderId);
    }
    Ok(id)
}

/// Create the local data folder if needed and return it.
pub async fn prepare_local_path(path: &Path) -> Result<PathBuf, StorageError> {
    if path.as_os_str().is_empty() {
        return Err(StorageError::EmptyPath);
    }
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| StorageError::LocalPath {
            path: path.to_path_buf(),
            source,
        })?;

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|source| StorageError::LocalPath {
            path: path.to_path_buf(),
            source,
        })?;
    if !metadata.is_dir() {
        return Err(StorageError::LocalPath {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
        });
    }
    info!(
        "[PHASE: storage] [STEP: local_path] Data folder ready at {:?}",
        path
    );
    Ok(path.to_path_buf())
}
