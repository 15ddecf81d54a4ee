// Google Drive folder probe (service-account JWT bearer flow)

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::CloudSettings;
use crate::setup::storage::{RemoteFolderProbe, ServiceAccountKey, StorageError};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: Option<String>,
    name: Option<String>,
    mime_type: Option<String>,
}

pub struct GoogleDriveProbe {
    api_base: String,
    scope: String,
    timeout: Duration,
}

impl GoogleDriveProbe {
    pub fn new(settings: &CloudSettings) -> Self {
        Self {
            api_base: settings.drive_api_base.trim_end_matches('/').to_string(),
            scope: settings.scope.clone(),
            timeout: Duration::from_secs(settings.request_timeout_secs),
        }
    }

    fn folder_url(&self, folder_id: &str) -> String {
        format!(
            "{}/files/{}?fields=id,name,mimeType&supportsAllDrives=true",
            self.api_base, folder_id
        )
    }

    fn sign_assertion(&self, key: &ServiceAccountKey, now: i64) -> Result<String, StorageError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key.private_key_id.clone());
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: &self.scope,
            aud: &key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let signing_key =
            EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| remote_error(
                "The service account private key could not be read.",
                format!("Invalid RSA key: {}", e),
            ))?;
        jsonwebtoken::encode(&header, &claims, &signing_key).map_err(|e| {
            remote_error(
                "The service account private key could not be used.",
                format!("JWT signing failed: {}", e),
            )
        })
    }

    async fn access_token(
        &self,
        client: &reqwest::Client,
        key: &ServiceAccountKey,
    ) -> Result<String, StorageError> {
        let assertion = self.sign_assertion(key, chrono::Utc::now().timestamp())?;
        let resp = client
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| unreachable_error(format!("Token request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(remote_error(
                "Google rejected the service account credentials.",
                format!("Token endpoint returned HTTP {}", resp.status()),
            ));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| unreachable_error(format!("Malformed token response: {}", e)))?;
        Ok(token.access_token)
    }
}

fn remote_error(user_message: &str, internal_details: String) -> StorageError {
    StorageError::RemoteFolder {
        user_message: user_message.to_string(),
        internal_details,
    }
}

fn unreachable_error(internal_details: String) -> StorageError {
    remote_error(
        "Google Drive could not be reached. Check the network connection.",
        internal_details,
    )
}

#[async_trait]
impl RemoteFolderProbe for GoogleDriveProbe {
    async fn check_folder(
        &self,
        key: &ServiceAccountKey,
        folder_id: &str,
    ) -> Result<(), StorageError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| unreachable_error(format!("HTTP client init failed: {}", e)))?;

        let token = self.access_token(&client, key).await?;
        let resp = client
            .get(self.folder_url(folder_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| unreachable_error(format!("Folder request failed: {}", e)))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            warn!(
                "[PHASE: storage] [STEP: drive_probe] Folder lookup returned HTTP {}",
                status
            );
            return Err(remote_error(
                "The Google Drive folder was not found or is not shared with the service account.",
                format!("Drive files.get returned HTTP {}", status),
            ));
        }

        let file: DriveFile = resp
            .json()
            .await
            .map_err(|e| unreachable_error(format!("Malformed drive response: {}", e)))?;
        if file.id.is_none() {
            return Err(remote_error(
                "The Google Drive folder was not found or is not shared with the service account.",
                "Drive response carried no id".to_string(),
            ));
        }
        if file.mime_type.as_deref() != Some(FOLDER_MIME_TYPE) {
            warn!(
                "[PHASE: storage] [STEP: drive_probe] Drive item is not a folder (mimeType={:?})",
                file.mime_type
            );
        }
        info!(
            "[PHASE: storage] [STEP: drive_probe] Drive folder reachable ({})",
            file.name.as_deref().unwrap_or("unnamed")
        );
        Ok(())
    }
}
