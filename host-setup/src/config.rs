// Layered settings: built-in defaults < oddm_setup.toml < ODDM_SETUP__* environment

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::utils::path_resolver::config_file_path;
use crate::utils::validation::validate_postgres_identifier;

const ENV_PREFIX: &str = "ODDM_SETUP";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    pub database: DatabaseSettings,
    pub marker: MarkerSettings,
    pub storage: StorageSettings,
    pub cloud: CloudSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    /// Administrative role the operator authenticates as.
    pub admin_role: String,
    /// Database the administrative session opens first.
    pub admin_database: String,
    pub target_database: String,
    pub service_role: String,
    pub schema: String,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            admin_role: "postgres".to_string(),
            admin_database: "postgres".to_string(),
            target_database: "oddm_toolkit_db".to_string(),
            service_role: "oddm_admin".to_string(),
            schema: "public".to_string(),
            connect_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerSettings {
    pub file_name: String,
}

impl Default for MarkerSettings {
    fn default() -> Self {
        Self {
            file_name: ".oddm_setup_config".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir_name: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir_name: "ODDM_data".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub expected_account_type: String,
    pub drive_api_base: String,
    pub scope: String,
    pub request_timeout_secs: u64,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            expected_account_type: "service_account".to_string(),
            drive_api_base: "https://www.googleapis.com/drive/v3".to_string(),
            scope: "https://www.googleapis.com/auth/drive".to_string(),
            request_timeout_secs: 20,
        }
    }
}

impl SetupConfig {
    /// Load settings for a deployment folder and validate them.
    pub fn load(deployment_folder: &Path) -> Result<Self> {
        let env = Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true);
        Self::load_layers(&config_file_path(deployment_folder), env)
    }

    fn load_layers(file: &Path, env: Environment) -> Result<Self> {
        let cfg: SetupConfig = Config::builder()
            .add_source(File::from(file).required(false))
            .add_source(env)
            .build()
            .with_context(|| format!("Failed to read configuration ({:?})", file))?
            .try_deserialize()
            .context("Invalid configuration values")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let db = &self.database;
        if db.host.trim().is_empty() {
            anyhow::bail!("database.host cannot be empty");
        }
        if db.port == 0 {
            anyhow::bail!("database.port must be non-zero");
        }
        validate_postgres_identifier("database.target_database", &db.target_database)?;
        validate_postgres_identifier("database.service_role", &db.service_role)?;
        if db.admin_role.trim().is_empty() || db.admin_database.trim().is_empty() {
            anyhow::bail!("database.admin_role and database.admin_database are required");
        }
        if db.schema.trim().is_empty() {
            anyhow::bail!("database.schema cannot be empty");
        }
        if db.connect_timeout_secs == 0 {
            anyhow::bail!("database.connect_timeout_secs must be non-zero");
        }

        let marker = self.marker.file_name.as_str();
        if marker.is_empty() || marker.contains(['/', '\\']) {
            anyhow::bail!("marker.file_name must be a plain file name");
        }
        if self.storage.data_dir_name.trim().is_empty() {
            anyhow::bail!("storage.data_dir_name cannot be empty");
        }
        if self.cloud.expected_account_type.trim().is_empty() {
            anyhow::bail!("cloud.expected_account_type cannot be empty");
        }
        Ok(())
    }
}
