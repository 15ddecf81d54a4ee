use anyhow::Result;
use std::path::{Path, PathBuf};

const LOG_FOLDER_NAME: &str = "Setup_Wizard_Log";

/// Resolve deployment folder (absolute path)
pub fn resolve_deployment_folder() -> PathBuf {
    // Prefer the folder where the EXE is running from (works in dev and deployed)
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(dir) = exe_path.parent() {
            return dir.to_path_buf();
        }
    }

    // Fallback: current working directory
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Resolve log folder (absolute path)
///
/// Logs live next to the deployment folder. When that location is read-only (installed under a
/// system prefix), fall back to the per-user local data directory.
pub fn resolve_log_folder(deployment_folder: &Path) -> Result<PathBuf> {
    let primary = deployment_folder.join(LOG_FOLDER_NAME);
    if std::fs::create_dir_all(&primary).is_ok() {
        return Ok(primary);
    }

    let fallback = dirs::data_local_dir()
        .ok_or_else(|| anyhow::anyhow!("No writable location for the log folder"))?
        .join("oddm-host-setup")
        .join(LOG_FOLDER_NAME);
    std::fs::create_dir_all(&fallback)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", fallback, e))?;
    Ok(fallback)
}

/// Location of the encrypted setup marker for an installation root.
pub fn marker_path(deployment_folder: &Path, file_name: &str) -> PathBuf {
    deployment_folder.join(file_name)
}

/// Suggested local data directory shown on the storage page.
pub fn default_storage_path(deployment_folder: &Path, dir_name: &str) -> PathBuf {
    deployment_folder.join(dir_name)
}

/// Optional configuration file next to the executable.
pub fn config_file_path(deployment_folder: &Path) -> PathBuf {
    deployment_folder.join("oddm_setup.toml")
}
