// Setup wizard state machine
//
// AlreadySetUp -> AwaitAdminPassword -> [AwaitReAuthConsent] -> AwaitUserDetails
//   -> AwaitPasswordReVerification -> Provisioning -> AwaitStorageSelection -> Completed
//
// Every operator action arrives through `dispatch`. Recoverable failures route back to the page
// that can fix them and are reported through the presenter with the offending fields.

use anyhow::anyhow;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::SetupConfig;
use crate::database::connection::{ConnectError, ConnectionManager, Credential, DbConnector, Identity};
use crate::database::provisioning::{
    DatabaseProvisioner, ProvisionError, ProvisionedCredentials, ProvisioningRequest,
};
use crate::database::users::{UserDirectory, EMAIL_MAX_LEN, USERNAME_MAX_LEN};
use crate::models::marker::{CloudBackupRecord, SetupMarker};
use crate::security::marker_store::EncryptedMarkerStore;
use crate::setup::error::{PasswordMismatch, SetupError, ValidationError};
use crate::setup::events::{FormField, SetupEvent, SetupForm, SetupPresenter, SetupState};
use crate::setup::storage::{
    prepare_local_path, validate_credential_file, validate_folder_id, RemoteFolderProbe,
    StorageError, StorageSelection,
};
use crate::utils::validation::is_valid_email;

pub struct SetupOrchestrator {
    settings: SetupConfig,
    connections: ConnectionManager,
    provisioner: DatabaseProvisioner,
    directory: UserDirectory,
    marker: EncryptedMarkerStore,
    probe: Arc<dyn RemoteFolderProbe>,
    state: SetupState,
    admin_password: Option<String>,
    form: SetupForm,
    credentials: Option<ProvisionedCredentials>,
    run_id: String,
}

impl SetupOrchestrator {
    pub fn new(
        settings: SetupConfig,
        connector: Arc<dyn DbConnector>,
        marker: EncryptedMarkerStore,
        probe: Arc<dyn RemoteFolderProbe>,
        default_local_path: PathBuf,
    ) -> Self {
        let connections =
            ConnectionManager::new(connector, settings.database.host.clone(), settings.database.port);
        let provisioner = DatabaseProvisioner::new(&settings.database);
        let directory = UserDirectory::new(settings.database.schema.clone());
        Self {
            settings,
            connections,
            provisioner,
            directory,
            marker,
            probe,
            state: SetupState::AwaitAdminPassword,
            admin_password: None,
            form: SetupForm {
                local_path: default_local_path,
                ..SetupForm::default()
            },
            credentials: None,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn state(&self) -> SetupState {
        self.state
    }

    pub fn form(&self) -> &SetupForm {
        &self.form
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Pick the first page: an existing marker means setup already ran.
    pub fn start(&mut self, presenter: &mut dyn SetupPresenter) -> SetupState {
        info!(
            "[PHASE: setup] [STEP: start] Setup run started (run_id={}, marker={:?})",
            self.run_id,
            self.marker.path()
        );
        let first = if self.marker.exists() {
            info!("[PHASE: setup] [STEP: start] Setup marker found; asking before re-running");
            SetupState::AlreadySetUp
        } else {
            SetupState::AwaitAdminPassword
        };
        self.transition(first, presenter);
        first
    }

    /// Handle one operator event. Events that do not apply to the current page are ignored.
    pub async fn dispatch(
        &mut self,
        event: SetupEvent,
        presenter: &mut dyn SetupPresenter,
    ) -> Result<SetupState, SetupError> {
        debug!(
            "[PHASE: setup] [STEP: dispatch] {} in {:?}",
            event.name(),
            self.state
        );

        let outcome = match (self.state, event) {
            (_, SetupEvent::Close) => {
                self.shutdown().await;
                presenter.advance_to(SetupState::Closed, &self.form);
                Ok(())
            }
            (SetupState::AlreadySetUp, SetupEvent::Proceed) => {
                self.transition(SetupState::AwaitAdminPassword, presenter);
                Ok(())
            }
            (SetupState::AwaitAdminPassword, SetupEvent::AdminPasswordSubmitted { password }) => {
                self.on_admin_password(password, presenter).await
            }
            (SetupState::AwaitReAuthConsent, SetupEvent::Proceed) => {
                self.transition(SetupState::AwaitUserDetails, presenter);
                Ok(())
            }
            (
                SetupState::AwaitUserDetails,
                SetupEvent::UserDetailsSubmitted {
                    service_password,
                    email,
                    username,
                    superuser_password,
                },
            ) => self.on_user_details(
                service_password,
                email,
                username,
                superuser_password,
                presenter,
            ),
            (
                SetupState::AwaitPasswordReVerification,
                SetupEvent::PasswordsReVerified {
                    service_password,
                    superuser_password,
                },
            ) => {
                self.on_passwords_reverified(service_password, superuser_password, presenter)
                    .await
            }
            (SetupState::AwaitStorageSelection, SetupEvent::StorageSubmitted(selection)) => {
                self.on_storage_selected(selection, presenter).await
            }
            (state, event) => {
                warn!(
                    "[PHASE: setup] [STEP: dispatch] Ignoring {} in {:?}",
                    event.name(),
                    state
                );
                Ok(())
            }
        };

        match outcome {
            Ok(()) => Ok(self.state),
            Err(e) => {
                self.report(&e, presenter);
                Err(e)
            }
        }
    }

    /// Whether the toolkit database already has an admin user.
    ///
    /// Runs over the admin session: hops into the target database when it exists and always
    /// returns to the administrative database.
    pub async fn check_admin_exists(&mut self) -> anyhow::Result<bool> {
        let admin = self.admin_credential()?;
        let db = self.settings.database.clone();

        let target_exists = {
            let session = self
                .connections
                .current_connection()
                .ok_or_else(|| anyhow!("No administrative session is open"))?;
            session.database_exists(&db.target_database).await?
        };
        if !target_exists {
            debug!("[PHASE: setup] [STEP: admin_check] Toolkit database does not exist yet");
            return Ok(false);
        }

        if !self
            .connections
            .connect(Identity::Admin, &admin, &db.target_database)
            .await
        {
            anyhow::bail!(
                "Could not open '{}' as the administrative role",
                db.target_database
            );
        }
        let found = match self.connections.current_connection() {
            Some(session) => self.directory.admin_exists(session).await,
            None => Err(anyhow!("Administrative session was lost")),
        };
        let restored = self
            .connections
            .connect(Identity::Admin, &admin, &db.admin_database)
            .await;

        let found = found?;
        if !restored {
            anyhow::bail!("Could not return to the administrative database");
        }
        info!(
            "[PHASE: setup] [STEP: admin_check] Existing admin user: {}",
            found
        );
        Ok(found)
    }

    /// Close any session and forget the admin password.
    pub async fn shutdown(&mut self) {
        self.connections.close().await;
        self.admin_password = None;
        self.state = SetupState::Closed;
        info!(
            "[PHASE: setup] [STEP: shutdown] Setup run {} closed",
            self.run_id
        );
    }

    // -------------------------------------------------------------------------
    // Page handlers
    // -------------------------------------------------------------------------

    async fn on_admin_password(
        &mut self,
        password: String,
        presenter: &mut dyn SetupPresenter,
    ) -> Result<(), SetupError> {
        if password.is_empty() {
            return Err(ValidationError::MissingFields(vec![FormField::AdminPassword]).into());
        }

        let credential = Credential::new(&self.settings.database.admin_role, &password);
        let admin_db = self.settings.database.admin_database.clone();
        if !self
            .connections
            .connect(Identity::Admin, &credential, &admin_db)
            .await
        {
            return Err(SetupError::Connectivity(self.last_connect_error()));
        }
        self.admin_password = Some(password);

        let admin_exists = self.check_admin_exists().await.map_err(|e| {
            SetupError::fatal("Could not inspect the existing ODDM Toolkit database.", e)
        })?;
        let next = if admin_exists {
            SetupState::AwaitReAuthConsent
        } else {
            SetupState::AwaitUserDetails
        };
        self.transition(next, presenter);
        Ok(())
    }

    fn on_user_details(
        &mut self,
        service_password: String,
        email: String,
        username: String,
        superuser_password: String,
        presenter: &mut dyn SetupPresenter,
    ) -> Result<(), SetupError> {
        self.form.email = email.trim().to_string();
        self.form.username = username.trim().to_string();
        self.form.superuser_password = superuser_password;
        if !self.form.service_password_locked {
            self.form.service_password = service_password;
        }

        let mut missing = Vec::new();
        if self.form.service_password.is_empty() {
            missing.push(FormField::ServicePassword);
        }
        if self.form.email.is_empty() {
            missing.push(FormField::Email);
        }
        if self.form.username.is_empty() {
            missing.push(FormField::Username);
        }
        if self.form.superuser_password.is_empty() {
            missing.push(FormField::SuperuserPassword);
        }
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields(missing).into());
        }
        if !is_valid_email(&self.form.email) {
            return Err(ValidationError::InvalidEmail.into());
        }
        if self.form.username.chars().count() > USERNAME_MAX_LEN {
            return Err(ValidationError::UsernameTooLong {
                max: USERNAME_MAX_LEN,
            }
            .into());
        }
        if self.form.email.chars().count() > EMAIL_MAX_LEN {
            return Err(ValidationError::EmailTooLong { max: EMAIL_MAX_LEN }.into());
        }

        self.transition(SetupState::AwaitPasswordReVerification, presenter);
        Ok(())
    }

    async fn on_passwords_reverified(
        &mut self,
        service_confirm: String,
        superuser_confirm: String,
        presenter: &mut dyn SetupPresenter,
    ) -> Result<(), SetupError> {
        let service_ok =
            self.form.service_password_locked || service_confirm == self.form.service_password;
        let superuser_ok = superuser_confirm == self.form.superuser_password;

        if let Some(kind) = PasswordMismatch::classify(service_ok, superuser_ok) {
            if kind.service_role_mismatched() {
                self.form.service_password.clear();
            }
            if kind.superuser_mismatched() {
                self.form.superuser_password.clear();
            }
            self.transition(SetupState::AwaitUserDetails, presenter);
            return Err(ValidationError::PasswordMismatch(kind).into());
        }

        self.run_provisioning(presenter).await
    }

    async fn run_provisioning(
        &mut self,
        presenter: &mut dyn SetupPresenter,
    ) -> Result<(), SetupError> {
        self.transition(SetupState::Provisioning, presenter);

        let admin = self.admin_credential().map_err(|e| {
            SetupError::fatal("The administrator password is no longer available.", e)
        })?;
        let admin_db = self.settings.database.admin_database.clone();
        if !self.connections.is_connected_as(Identity::Admin, &admin_db)
            && !self
                .connections
                .connect(Identity::Admin, &admin, &admin_db)
                .await
        {
            self.admin_password = None;
            self.transition(SetupState::AwaitAdminPassword, presenter);
            return Err(SetupError::Connectivity(self.last_connect_error()));
        }

        let request = ProvisioningRequest {
            service_password: self.form.service_password.clone(),
            admin_password: admin.password().to_string(),
            superuser_email: self.form.email.clone(),
            superuser_name: self.form.username.clone(),
            superuser_password: self.form.superuser_password.clone(),
        };

        match self
            .provisioner
            .provision(&mut self.connections, &request)
            .await
        {
            Ok(credentials) => {
                self.credentials = Some(credentials);
                self.form.service_password_locked = false;
                self.transition(SetupState::AwaitStorageSelection, presenter);
                Ok(())
            }
            Err(ProvisionError::AlreadyProvisioned) => {
                self.reject_service_password(presenter);
                Err(SetupError::AlreadyProvisioned)
            }
            Err(ProvisionError::ServiceRoleRejected) => {
                self.reject_service_password(presenter);
                Err(SetupError::ServiceRoleRejected)
            }
            Err(ProvisionError::DirectoryConflict(kind)) => {
                // The service login already succeeded; only the user fields need another pass.
                self.form.service_password_locked = true;
                self.transition(SetupState::AwaitUserDetails, presenter);
                Err(SetupError::DirectoryConflict(kind))
            }
            Err(other) => Err(SetupError::fatal(
                format!("Database setup failed: {}", other),
                anyhow::Error::new(other),
            )),
        }
    }

    async fn on_storage_selected(
        &mut self,
        selection: StorageSelection,
        presenter: &mut dyn SetupPresenter,
    ) -> Result<(), SetupError> {
        if selection.local_path.as_os_str().is_empty() {
            return Err(SetupError::StorageAccess(StorageError::EmptyPath));
        }
        self.form.local_path = selection.local_path.clone();

        let cloud = match selection.cloud {
            None => CloudBackupRecord::disabled(),
            Some(request) => {
                let validated = validate_credential_file(
                    &request.credential_file,
                    &self.settings.cloud.expected_account_type,
                )
                .await
                .map_err(|e| SetupError::Validation(ValidationError::CredentialFile(e)))?;
                let folder_id =
                    validate_folder_id(&request.folder_id).map_err(SetupError::StorageAccess)?;
                self.probe
                    .check_folder(&validated.key, folder_id)
                    .await
                    .map_err(SetupError::StorageAccess)?;
                CloudBackupRecord::enabled(validated.document)
            }
        };

        let data_path = prepare_local_path(&selection.local_path)
            .await
            .map_err(SetupError::StorageAccess)?;

        let credentials = self.credentials.clone().ok_or_else(|| {
            SetupError::fatal(
                "Database setup has not completed.",
                anyhow!("storage submitted without provisioned credentials"),
            )
        })?;
        let marker = SetupMarker::new(
            &credentials,
            data_path.to_string_lossy().into_owned(),
            cloud,
        );
        self.marker
            .write(&marker)
            .await
            .map_err(SetupError::Persistence)?;

        self.connections.close().await;
        self.transition(SetupState::Completed, presenter);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn reject_service_password(&mut self, presenter: &mut dyn SetupPresenter) {
        self.form.service_password.clear();
        self.form.service_password_locked = false;
        self.transition(SetupState::AwaitUserDetails, presenter);
    }

    fn admin_credential(&self) -> anyhow::Result<Credential> {
        let password = self
            .admin_password
            .as_deref()
            .ok_or_else(|| anyhow!("Administrator password has not been verified"))?;
        Ok(Credential::new(&self.settings.database.admin_role, password))
    }

    fn last_connect_error(&self) -> ConnectError {
        self.connections
            .last_error()
            .cloned()
            .unwrap_or_else(|| ConnectError {
                user_message: "Unable to connect to PostgreSQL.".to_string(),
                internal_details: "connect returned false without an error".to_string(),
            })
    }

    fn transition(&mut self, next: SetupState, presenter: &mut dyn SetupPresenter) {
        if self.state != next {
            info!(
                "[PHASE: setup] [STEP: transition] {:?} -> {:?}",
                self.state, next
            );
        }
        self.state = next;
        self.form.highlighted.clear();
        presenter.advance_to(next, &self.form);
    }

    fn report(&mut self, err: &SetupError, presenter: &mut dyn SetupPresenter) {
        let code = err.code().unwrap_or("-");
        let input_only = match err {
            SetupError::Validation(_) => true,
            SetupError::StorageAccess(e) => e.is_input_error(),
            _ => false,
        };
        if input_only {
            info!(
                "[PHASE: setup] [STEP: error] Input rejected in {:?}: {}",
                self.state, err
            );
        } else if err.is_recoverable() {
            warn!(
                "[PHASE: setup] [STEP: error] {} ({}) in {:?}: {}",
                code,
                err,
                self.state,
                err.log_details()
            );
        } else {
            error!(
                "[PHASE: setup] [STEP: error] Fatal in {:?}: {}",
                self.state,
                err.log_details()
            );
        }
        self.form.highlighted = err.fields();
        presenter.show_error(&err.to_string(), &self.form.highlighted);
    }
}
