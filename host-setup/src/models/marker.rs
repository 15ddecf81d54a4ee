// Setup marker document
//
// Field names are the keys the toolkit reads at startup; do not rename.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::database::provisioning::ProvisionedCredentials;

/// Cloud backup section: `data` holds the full service-account document when enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudBackupRecord {
    pub status: bool,
    pub data: Option<Value>,
}

impl CloudBackupRecord {
    pub fn disabled() -> Self {
        Self {
            status: false,
            data: None,
        }
    }

    pub fn enabled(document: Value) -> Self {
        Self {
            status: true,
            data: Some(document),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupMarker {
    pub oddm_db_name: String,
    pub oddm_db_user: String,
    pub oddm_db_password: String,
    pub data_storage_path: String,
    pub gdrive_service_json_data: CloudBackupRecord,
}

impl SetupMarker {
    pub fn new(
        credentials: &ProvisionedCredentials,
        data_storage_path: String,
        cloud: CloudBackupRecord,
    ) -> Self {
        Self {
            oddm_db_name: credentials.database_name.clone(),
            oddm_db_user: credentials.service_role.clone(),
            oddm_db_password: credentials.service_password.clone(),
            data_storage_path,
            gdrive_service_json_data: cloud,
        }
    }
}

impl fmt::Debug for SetupMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupMarker")
            .field("oddm_db_name", &self.oddm_db_name)
            .field("oddm_db_user", &self.oddm_db_user)
            .field("oddm_db_password", &"***")
            .field("data_storage_path", &self.data_storage_path)
            .field("cloud_backup", &self.gdrive_service_json_data.status)
            .finish()
    }
}
