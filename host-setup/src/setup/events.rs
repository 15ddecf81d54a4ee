// Wizard states, operator events and the presenter seam

use std::fmt;
use std::path::PathBuf;

use crate::setup::storage::StorageSelection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    /// A marker already exists; the operator may proceed anyway or close.
    AlreadySetUp,
    AwaitAdminPassword,
    /// An admin user already exists in the toolkit database.
    AwaitReAuthConsent,
    AwaitUserDetails,
    AwaitPasswordReVerification,
    Provisioning,
    AwaitStorageSelection,
    Completed,
    Closed,
}

impl SetupState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SetupState::Closed)
    }

    pub fn title(&self) -> &'static str {
        match self {
            SetupState::AlreadySetUp => "Already set up",
            SetupState::AwaitAdminPassword => "Administrator password",
            SetupState::AwaitReAuthConsent => "Admin already exists",
            SetupState::AwaitUserDetails => "ODDM user details",
            SetupState::AwaitPasswordReVerification => "Confirm passwords",
            SetupState::Provisioning => "Provisioning",
            SetupState::AwaitStorageSelection => "Data storage",
            SetupState::Completed => "Setup complete",
            SetupState::Closed => "Closed",
        }
    }
}

/// Form fields the orchestrator can flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormField {
    AdminPassword,
    ServicePassword,
    Email,
    Username,
    SuperuserPassword,
    ConfirmServicePassword,
    ConfirmSuperuserPassword,
    LocalPath,
    CredentialFile,
    FolderId,
}

/// An operator action, carrying the literal field values.
#[derive(Clone)]
pub enum SetupEvent {
    /// "Yes" on a confirmation page.
    Proceed,
    Close,
    AdminPasswordSubmitted {
        password: String,
    },
    UserDetailsSubmitted {
        service_password: String,
        email: String,
        username: String,
        superuser_password: String,
    },
    PasswordsReVerified {
        service_password: String,
        superuser_password: String,
    },
    StorageSubmitted(StorageSelection),
}

impl SetupEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SetupEvent::Proceed => "proceed",
            SetupEvent::Close => "close",
            SetupEvent::AdminPasswordSubmitted { .. } => "admin_password_submitted",
            SetupEvent::UserDetailsSubmitted { .. } => "user_details_submitted",
            SetupEvent::PasswordsReVerified { .. } => "passwords_reverified",
            SetupEvent::StorageSubmitted(_) => "storage_submitted",
        }
    }
}

impl fmt::Debug for SetupEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupEvent::UserDetailsSubmitted {
                email, username, ..
            } => f
                .debug_struct("UserDetailsSubmitted")
                .field("email", email)
                .field("username", username)
                .finish_non_exhaustive(),
            SetupEvent::StorageSubmitted(selection) => {
                f.debug_tuple("StorageSubmitted").field(selection).finish()
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Values the operator has entered so far. Re-sent to the presenter on every transition so
/// pages can be prefilled; cleared fields come back empty.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SetupForm {
    pub service_password: String,
    pub email: String,
    pub username: String,
    pub superuser_password: String,
    /// Set after a directory conflict: the service password already authenticated.
    pub service_password_locked: bool,
    pub local_path: PathBuf,
    pub highlighted: Vec<FormField>,
}

impl fmt::Debug for SetupForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupForm")
            .field("email", &self.email)
            .field("username", &self.username)
            .field("service_password_set", &!self.service_password.is_empty())
            .field("superuser_password_set", &!self.superuser_password.is_empty())
            .field("service_password_locked", &self.service_password_locked)
            .field("local_path", &self.local_path)
            .field("highlighted", &self.highlighted)
            .finish()
    }
}

/// The two primitives the orchestrator uses to talk back to the presentation layer.
pub trait SetupPresenter {
    fn show_error(&mut self, message: &str, fields: &[FormField]);
    fn advance_to(&mut self, state: SetupState, form: &SetupForm);
}
