// Stable local machine identity used to bind the setup marker to one host.

use anyhow::Result;
use log::debug;
#[cfg(target_os = "linux")]
use log::warn;
use std::fmt;

#[cfg(target_os = "linux")]
const MACHINE_ID_FILES: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Opaque machine identifier. Only its digest is ever used as key material.
#[derive(Clone, PartialEq, Eq)]
pub struct MachineIdentity(String);

impl MachineIdentity {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Detect the identity of the current host.
    ///
    /// Linux hosts use the systemd/dbus machine id; elsewhere (or when it is missing) the host
    /// name is used.
    pub fn detect() -> Result<Self> {
        if let Some(id) = platform_machine_id() {
            return Ok(Self(id));
        }

        let host = gethostname::gethostname();
        let host = host.to_string_lossy().trim().to_string();
        if host.is_empty() {
            anyhow::bail!("Unable to determine a stable machine identifier");
        }
        debug!("[PHASE: security] [STEP: machine_id] Using host name as machine identity");
        Ok(Self(host))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

#[cfg(target_os = "linux")]
fn platform_machine_id() -> Option<String> {
    for path in MACHINE_ID_FILES {
        match std::fs::read_to_string(path) {
            Ok(raw) if !raw.trim().is_empty() => {
                debug!(
                    "[PHASE: security] [STEP: machine_id] Using machine id from {}",
                    path
                );
                return Some(raw.trim().to_string());
            }
            Ok(_) => warn!(
                "[PHASE: security] [STEP: machine_id] {} is empty; trying next source",
                path
            ),
            Err(e) => debug!(
                "[PHASE: security] [STEP: machine_id] {} unavailable: {}",
                path, e
            ),
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn platform_machine_id() -> Option<String> {
    None
}

impl fmt::Debug for MachineIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MachineIdentity(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_does_not_reveal_identifier() {
        let id = MachineIdentity::from_raw("4c4c4544-0047-3010-8052-b4c04f4d4e32");
        assert_eq!(format!("{:?}", id), "MachineIdentity(***)");
    }

    #[test]
    fn detect_returns_non_empty_identity() {
        let id = MachineIdentity::detect().expect("host should expose some identity");
        assert!(!id.as_bytes().is_empty());
    }
}
