// Encrypted setup marker (encryption-at-rest)
//
// The marker is the durable "setup complete" signal. It provides:
// - A versioned envelope: version || issued_at (u64 BE) || nonce || AES-256-GCM ciphertext+tag,
//   stored base64url-encoded
// - A key derived from the local machine identity, so a copied file does not decrypt elsewhere
// - Remove-then-write replacement (a short window without a marker is accepted)
//
// The machine binding is a deterrent against casual copying, not protection against a local
// attacker who can read the same machine identifier.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use log::{debug, info, warn};
use ring::rand::{SecureRandom, SystemRandom};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::security::crypto::{derive_machine_key, secret_fingerprint, KEY_BYTES};
use crate::security::machine_id::MachineIdentity;

const ENVELOPE_VERSION: u8 = 0x01;
const TIMESTAMP_BYTES: usize = 8;
const NONCE_BYTES: usize = 12;
const HEADER_BYTES: usize = 1 + TIMESTAMP_BYTES;
const TAG_BYTES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum MarkerError {
    #[error("Setup marker does not exist: {0:?}")]
    NotFound(PathBuf),
    #[error("Setup marker could not be decrypted: {0}")]
    Undecryptable(String),
    #[error("Setup marker encryption failed: {0}")]
    Encryption(String),
    #[error("Setup marker content is not valid: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Setup marker I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Decoded envelope header, exposed for diagnostics (`--status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeInfo {
    pub version: u8,
    pub issued_at: u64,
}

#[derive(Debug)]
pub struct EncryptedMarkerStore {
    path: PathBuf,
    key: [u8; KEY_BYTES],
}

impl EncryptedMarkerStore {
    pub fn new(path: PathBuf, identity: &MachineIdentity) -> Self {
        let key = Self::derive_key(identity);
        debug!(
            "[PHASE: security] [STEP: marker_key] Marker key derived (fingerprint={})",
            secret_fingerprint(&key)
        );
        Self { path, key }
    }

    /// Marker key for a machine: the SHA-256 digest of its identifier.
    pub fn derive_key(identity: &MachineIdentity) -> [u8; KEY_BYTES] {
        derive_machine_key(identity.as_bytes())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Serialize, encrypt and persist `data`, replacing any previous marker.
    pub async fn write<T: Serialize>(&self, data: &T) -> Result<(), MarkerError> {
        let plaintext = serde_json::to_vec(data)?;
        let issued_at = chrono::Utc::now().timestamp().max(0) as u64;
        let envelope = self.seal(&plaintext, issued_at)?;
        let encoded = base64::engine::general_purpose::URL_SAFE.encode(envelope);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| MarkerError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let write_action = || async {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => debug!(
                    "[PHASE: marker] [STEP: write] Removed previous marker {:?}",
                    self.path
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(MarkerError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
            write_private_file(&self.path, encoded.as_bytes())
                .await
                .map_err(|source| MarkerError::Io {
                    path: self.path.clone(),
                    source,
                })
        };

        let retry_strategy = ExponentialBackoff::from_millis(50)
            .factor(2)
            .max_delay(std::time::Duration::from_millis(750))
            .take(3)
            .map(jitter);

        RetryIf::start(retry_strategy, write_action, is_transient_io_error).await?;

        if let Err(e) = hide_file(&self.path) {
            warn!(
                "[PHASE: marker] [STEP: write] Could not mark {:?} hidden: {}",
                self.path, e
            );
        }

        info!(
            "[PHASE: marker] [STEP: write] Setup marker written to {:?}",
            self.path
        );
        Ok(())
    }

    /// Decrypt and deserialize the marker.
    pub async fn read<T: DeserializeOwned>(&self) -> Result<T, MarkerError> {
        let plaintext = self.read_plaintext().await?.1;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Decrypt the marker and return only its envelope header.
    pub async fn inspect(&self) -> Result<EnvelopeInfo, MarkerError> {
        Ok(self.read_plaintext().await?.0)
    }

    async fn read_plaintext(&self) -> Result<(EnvelopeInfo, Vec<u8>), MarkerError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MarkerError::NotFound(self.path.clone()))
            }
            Err(source) => {
                return Err(MarkerError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let text = String::from_utf8_lossy(&raw);
        let envelope = base64::engine::general_purpose::URL_SAFE
            .decode(text.trim())
            .map_err(|_| MarkerError::Undecryptable("marker is not a valid envelope".into()))?;
        self.open(&envelope)
    }

    fn seal(&self, plaintext: &[u8], issued_at: u64) -> Result<Vec<u8>, MarkerError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| MarkerError::Encryption("invalid AES-256 key length".into()))?;

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| MarkerError::Encryption("failed to generate nonce".into()))?;

        let mut header = Vec::with_capacity(HEADER_BYTES);
        header.push(ENVELOPE_VERSION);
        header.extend_from_slice(&issued_at.to_be_bytes());

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| MarkerError::Encryption("AES-GCM encryption failed".into()))?;

        let mut blob = header;
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn open(&self, envelope: &[u8]) -> Result<(EnvelopeInfo, Vec<u8>), MarkerError> {
        if envelope.len() < HEADER_BYTES + NONCE_BYTES + TAG_BYTES {
            return Err(MarkerError::Undecryptable("marker envelope is truncated".into()));
        }

        let (header, rest) = envelope.split_at(HEADER_BYTES);
        if header[0] != ENVELOPE_VERSION {
            return Err(MarkerError::Undecryptable(format!(
                "unsupported envelope version 0x{:02x}",
                header[0]
            )));
        }
        let mut ts = [0u8; TIMESTAMP_BYTES];
        ts.copy_from_slice(&header[1..]);
        let info = EnvelopeInfo {
            version: header[0],
            issued_at: u64::from_be_bytes(ts),
        };

        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_BYTES);
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| MarkerError::Undecryptable("invalid AES-256 key length".into()))?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| {
                MarkerError::Undecryptable(
                    "authentication failed (written on another machine or corrupted)".into(),
                )
            })?;
        Ok((info, plaintext))
    }
}

fn is_transient_io_error(err: &MarkerError) -> bool {
    let MarkerError::Io { source, .. } = err else {
        return false;
    };
    matches!(
        source.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    ) || {
        // File locks held by AV/indexers surface as generic errors on Windows.
        let msg = source.to_string().to_ascii_lowercase();
        msg.contains("used by another process") || msg.contains("sharing violation")
    }
}

async fn write_private_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    opts.mode(0o600);

    let mut file = opts.open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(windows)]
fn hide_file(path: &Path) -> std::io::Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use winapi::um::fileapi::{GetFileAttributesW, SetFileAttributesW, INVALID_FILE_ATTRIBUTES};
    use winapi::um::winnt::FILE_ATTRIBUTE_HIDDEN;

    let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
    // SAFETY: `wide` is a NUL-terminated UTF-16 path that outlives both calls.
    unsafe {
        let attrs = GetFileAttributesW(wide.as_ptr());
        if attrs == INVALID_FILE_ATTRIBUTES {
            return Err(std::io::Error::last_os_error());
        }
        if SetFileAttributesW(wide.as_ptr(), attrs | FILE_ATTRIBUTE_HIDDEN) == 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(windows))]
fn hide_file(_path: &Path) -> std::io::Result<()> {
    // Dot-prefixed file names are already hidden on Unix.
    Ok(())
}
