// Database provisioning: create the toolkit database, its service role and the first admin user
//
// Sequence (one pass, every step idempotent up to the user insert):
// 1. As admin on the administrative database: create the target database if absent
// 2. Create the service login role if absent (an existing role keeps its password; step 5 checks it)
// 3. GRANT ALL on the target database to the service role
// 4. Reconnect as admin to the *target* database, grant schema rights and hand schema ownership to
//    the service role
// 5. Reconnect as the service role; a rejected login means the role belongs to an earlier setup
// 6. Ensure the users table, insert the first admin user
// 7. Close and hand the service credentials back
//
// Nothing is rolled back on a late failure. Re-running repeats steps 1-4 harmlessly.

use log::{error, info, warn};
use std::fmt;

use crate::config::DatabaseSettings;
use crate::database::connection::{ConnectionManager, Credential, DbSession, Identity};
use crate::database::users::{self, ConflictKind, NewUser, UserDirectory, UserDirectoryError};

// =============================================================================
// SQL generation
// =============================================================================

/// Double-quote a PostgreSQL identifier
pub(crate) fn pg_quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal the way `quote_literal()` does: quotes doubled, and an `E''` literal
/// with doubled backslashes when the value contains any.
pub(crate) fn pg_quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if value.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// `"schema"."table"`
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", pg_quote_ident(schema), pg_quote_ident(table))
}

/// Generate CREATE DATABASE statement for PostgreSQL
pub fn postgres_create_db_stmt(db_name: &str, owner: Option<&str>) -> String {
    match owner {
        Some(o) if !o.trim().is_empty() => format!(
            "CREATE DATABASE {} OWNER {};",
            pg_quote_ident(db_name),
            pg_quote_ident(o)
        ),
        _ => format!("CREATE DATABASE {};", pg_quote_ident(db_name)),
    }
}

/// CREATE ROLE with LOGIN. The password is embedded as a literal: utility statements take no
/// bind parameters.
pub fn postgres_create_role_stmt(role: &str, password: &str) -> String {
    format!(
        "CREATE ROLE {} WITH LOGIN PASSWORD {};",
        pg_quote_ident(role),
        pg_quote_literal(password)
    )
}

pub fn postgres_grant_database_stmt(db_name: &str, role: &str) -> String {
    format!(
        "GRANT ALL PRIVILEGES ON DATABASE {} TO {};",
        pg_quote_ident(db_name),
        pg_quote_ident(role)
    )
}

pub fn postgres_grant_schema_stmt(schema: &str, role: &str) -> String {
    format!(
        "GRANT ALL ON SCHEMA {} TO {};",
        pg_quote_ident(schema),
        pg_quote_ident(role)
    )
}

pub fn postgres_alter_schema_owner_stmt(schema: &str, role: &str) -> String {
    format!(
        "ALTER SCHEMA {} OWNER TO {};",
        pg_quote_ident(schema),
        pg_quote_ident(role)
    )
}

/// Users table DDL. Kept column-for-column compatible with what the toolkit reads at runtime.
pub fn postgres_create_users_table_stmt(schema: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {} (
    id SERIAL PRIMARY KEY,
    username VARCHAR({}) UNIQUE,
    email VARCHAR({}) UNIQUE NOT NULL,
    password_hash VARCHAR(255),
    is_admin BOOLEAN DEFAULT FALSE,
    is_active BOOLEAN DEFAULT FALSE,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);"#,
        qualified_table(schema, users::USERS_TABLE),
        users::USERNAME_MAX_LEN,
        users::EMAIL_MAX_LEN
    )
}

// =============================================================================
// Types
// =============================================================================

/// Operator input for one provisioning run.
#[derive(Clone)]
pub struct ProvisioningRequest {
    pub service_password: String,
    pub admin_password: String,
    pub superuser_email: String,
    pub superuser_name: String,
    pub superuser_password: String,
}

impl fmt::Debug for ProvisioningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningRequest")
            .field("superuser_email", &self.superuser_email)
            .field("superuser_name", &self.superuser_name)
            .finish_non_exhaustive()
    }
}

/// Credentials the toolkit uses at runtime.
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisionedCredentials {
    pub database_name: String,
    pub service_role: String,
    pub service_password: String,
}

impl fmt::Debug for ProvisionedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionedCredentials")
            .field("database_name", &self.database_name)
            .field("service_role", &self.service_role)
            .field("service_password", &"***")
            .finish()
    }
}

pub type ProvisioningResult = Result<ProvisionedCredentials, ProvisionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    CreateDatabase,
    CreateRole,
    GrantDatabase,
    GrantSchema,
    CreateUserTable,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionStep::CreateDatabase => "create the toolkit database",
            ProvisionStep::CreateRole => "create the service role",
            ProvisionStep::GrantDatabase => "grant database privileges",
            ProvisionStep::GrantSchema => "configure the schema",
            ProvisionStep::CreateUserTable => "create the users table",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("No administrative database connection is open")]
    NotConnected,
    /// The database pre-existed and the service role rejected the supplied password.
    #[error("ODDM Toolkit database already exists. Invalid password provided.")]
    AlreadyProvisioned,
    /// The database is new, but the service role pre-existed with another password.
    #[error("The ODDM service role already exists with a different password.")]
    ServiceRoleRejected,
    #[error("{}", .0.message())]
    DirectoryConflict(ConflictKind),
    #[error("Failed to {step}")]
    Infrastructure {
        step: ProvisionStep,
        #[source]
        source: anyhow::Error,
    },
    #[error("Could not reconnect to '{database}' as the administrative role")]
    AdminReconnectFailed { database: String, details: String },
    #[error("Failed to create the first user")]
    UserCreation(#[source] UserDirectoryError),
}

impl ProvisionError {
    /// Legacy code for logs; infrastructure failures have none.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ProvisionError::AlreadyProvisioned => Some("ERR-ODDM-STUP-001"),
            ProvisionError::ServiceRoleRejected => Some("ERR-ODDM-STUP-002"),
            ProvisionError::DirectoryConflict(kind) => Some(kind.code()),
            _ => None,
        }
    }
}

fn infra(step: ProvisionStep) -> impl FnOnce(anyhow::Error) -> ProvisionError {
    move |source| ProvisionError::Infrastructure { step, source }
}

// =============================================================================
// DatabaseProvisioner
// =============================================================================

pub struct DatabaseProvisioner {
    admin_role: String,
    target_database: String,
    service_role: String,
    schema: String,
    directory: UserDirectory,
}

impl DatabaseProvisioner {
    pub fn new(settings: &DatabaseSettings) -> Self {
        Self {
            admin_role: settings.admin_role.clone(),
            target_database: settings.target_database.clone(),
            service_role: settings.service_role.clone(),
            schema: settings.schema.clone(),
            directory: UserDirectory::new(settings.schema.clone()),
        }
    }

    /// Run the bootstrap sequence. `manager` must hold an admin session on the administrative
    /// database.
    pub async fn provision(
        &self,
        manager: &mut ConnectionManager,
        request: &ProvisioningRequest,
    ) -> ProvisioningResult {
        let admin = Credential::new(&self.admin_role, &request.admin_password);
        let service = Credential::new(&self.service_role, &request.service_password);
        let db = self.target_database.as_str();
        let role = self.service_role.as_str();

        if manager.current_identity() != Some(Identity::Admin) {
            return Err(ProvisionError::NotConnected);
        }

        // Steps 1-3 on the existing admin session.
        let database_existed = {
            let session = manager
                .current_connection()
                .ok_or(ProvisionError::NotConnected)?;
            self.prepare_cluster(session, &request.service_password)
                .await?
        };

        // Step 4: schema ownership has to be changed from inside the target database.
        manager.close().await;
        self.reconnect_admin(manager, &admin).await?;
        {
            let session = manager
                .current_connection()
                .ok_or(ProvisionError::NotConnected)?;
            session
                .grant_schema_privileges(&self.schema, role)
                .await
                .map_err(infra(ProvisionStep::GrantSchema))?;
            session
                .set_schema_owner(&self.schema, role)
                .await
                .map_err(infra(ProvisionStep::GrantSchema))?;
        }
        info!(
            "[PHASE: provisioning] [STEP: schema] Schema '{}' granted to and owned by the service role",
            self.schema
        );
        manager.close().await;

        // Step 5
        if !manager.connect(Identity::Service, &service, db).await {
            let outcome = if database_existed {
                ProvisionError::AlreadyProvisioned
            } else {
                ProvisionError::ServiceRoleRejected
            };
            warn!(
                "[PHASE: provisioning] [STEP: service_login] Service role login rejected ({})",
                outcome.code().unwrap_or("-")
            );
            if let Err(e) = self.reconnect_admin(manager, &admin).await {
                error!(
                    "[PHASE: provisioning] [STEP: service_login] Admin session not restored: {}",
                    e
                );
            }
            return Err(outcome);
        }

        // Step 6
        let inserted = {
            let session = manager
                .current_connection()
                .ok_or(ProvisionError::NotConnected)?;
            self.create_first_user(session, request).await
        };
        // Step 7
        manager.close().await;

        let user_id = inserted?;
        info!(
            "[PHASE: provisioning] [STEP: complete] Provisioning finished (first user id={})",
            user_id
        );
        Ok(ProvisionedCredentials {
            database_name: self.target_database.clone(),
            service_role: self.service_role.clone(),
            service_password: request.service_password.clone(),
        })
    }

    /// Steps 1-3. Returns whether the target database existed beforehand.
    async fn prepare_cluster(
        &self,
        session: &mut dyn DbSession,
        service_password: &str,
    ) -> Result<bool, ProvisionError> {
        let db = self.target_database.as_str();
        let role = self.service_role.as_str();

        let database_existed = session
            .database_exists(db)
            .await
            .map_err(infra(ProvisionStep::CreateDatabase))?;
        if database_existed {
            info!(
                "[PHASE: provisioning] [STEP: database] Database '{}' already exists",
                db
            );
        } else {
            session
                .create_database(db)
                .await
                .map_err(infra(ProvisionStep::CreateDatabase))?;
            info!("[PHASE: provisioning] [STEP: database] Created database '{}'", db);
        }

        let role_existed = session
            .role_exists(role)
            .await
            .map_err(infra(ProvisionStep::CreateRole))?;
        if role_existed {
            info!(
                "[PHASE: provisioning] [STEP: role] Service role already exists; its password is checked at login"
            );
        } else {
            session
                .create_login_role(role, service_password)
                .await
                .map_err(infra(ProvisionStep::CreateRole))?;
            info!("[PHASE: provisioning] [STEP: role] Created service role");
        }

        session
            .grant_database_privileges(db, role)
            .await
            .map_err(infra(ProvisionStep::GrantDatabase))?;
        info!(
            "[PHASE: provisioning] [STEP: grant] Granted privileges on '{}' to the service role",
            db
        );

        Ok(database_existed)
    }

    async fn reconnect_admin(
        &self,
        manager: &mut ConnectionManager,
        admin: &Credential,
    ) -> Result<(), ProvisionError> {
        if manager
            .connect(Identity::Admin, admin, &self.target_database)
            .await
        {
            return Ok(());
        }
        Err(ProvisionError::AdminReconnectFailed {
            database: self.target_database.clone(),
            details: manager
                .last_error()
                .map(|e| e.internal_details.clone())
                .unwrap_or_default(),
        })
    }

    async fn create_first_user(
        &self,
        session: &mut dyn DbSession,
        request: &ProvisioningRequest,
    ) -> Result<i64, ProvisionError> {
        self.directory
            .ensure_user_table_exists(session)
            .await
            .map_err(infra(ProvisionStep::CreateUserTable))?;

        let user = NewUser {
            username: Some(request.superuser_name.clone()),
            email: request.superuser_email.clone(),
            password: Some(request.superuser_password.clone()),
            is_admin: true,
            is_active: true,
        };
        match self.directory.insert_user(session, &user).await {
            Ok(id) => Ok(id),
            Err(UserDirectoryError::Conflict(kind)) => {
                warn!(
                    "[PHASE: provisioning] [STEP: first_user] Directory conflict ({})",
                    kind.code()
                );
                Err(ProvisionError::DirectoryConflict(kind))
            }
            Err(other) => Err(ProvisionError::UserCreation(other)),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::fake::{FakeCluster, FakeUser};

    const ADMIN_PW: &str = "admin-pw";

    fn settings() -> DatabaseSettings {
        DatabaseSettings::default()
    }

    fn request(service_pw: &str, email: &str, name: &str) -> ProvisioningRequest {
        ProvisioningRequest {
            service_password: service_pw.into(),
            admin_password: ADMIN_PW.into(),
            superuser_email: email.into(),
            superuser_name: name.into(),
            superuser_password: "first-admin-pw".into(),
        }
    }

    async fn admin_manager(cluster: &FakeCluster) -> ConnectionManager {
        let mut mgr = ConnectionManager::new(cluster.connector(), "localhost", 5432);
        assert!(
            mgr.connect(
                Identity::Admin,
                &Credential::new("postgres", ADMIN_PW),
                "postgres"
            )
            .await
        );
        mgr
    }

    #[test]
    fn test_postgres_create_db_stmt() {
        assert_eq!(
            postgres_create_db_stmt("testdb", None),
            "CREATE DATABASE \"testdb\";"
        );
        assert_eq!(
            postgres_create_db_stmt("testdb", Some("myuser")),
            "CREATE DATABASE \"testdb\" OWNER \"myuser\";"
        );
    }

    #[test]
    fn test_postgres_create_db_stmt_injection() {
        let stmt = postgres_create_db_stmt("test\"db", Some("my\"user"));
        assert_eq!(stmt, "CREATE DATABASE \"test\"\"db\" OWNER \"my\"\"user\";");
    }

    #[test]
    fn test_create_role_stmt_escapes_password() {
        assert_eq!(
            postgres_create_role_stmt("oddm_admin", "it's"),
            "CREATE ROLE \"oddm_admin\" WITH LOGIN PASSWORD 'it''s';"
        );
        assert_eq!(
            postgres_create_role_stmt("oddm_admin", r"a\b"),
            r#"CREATE ROLE "oddm_admin" WITH LOGIN PASSWORD E'a\\b';"#
        );
    }

    #[test]
    fn test_grant_and_owner_stmts() {
        assert_eq!(
            postgres_grant_database_stmt("oddm_toolkit_db", "oddm_admin"),
            "GRANT ALL PRIVILEGES ON DATABASE \"oddm_toolkit_db\" TO \"oddm_admin\";"
        );
        assert_eq!(
            postgres_grant_schema_stmt("public", "oddm_admin"),
            "GRANT ALL ON SCHEMA \"public\" TO \"oddm_admin\";"
        );
        assert_eq!(
            postgres_alter_schema_owner_stmt("public", "oddm_admin"),
            "ALTER SCHEMA \"public\" OWNER TO \"oddm_admin\";"
        );
    }

    #[test]
    fn test_users_table_ddl_shape() {
        let ddl = postgres_create_users_table_stmt("public");
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"public\".\"users\""));
        assert!(ddl.contains("id SERIAL PRIMARY KEY"));
        assert!(ddl.contains("username VARCHAR(50) UNIQUE,"));
        assert!(ddl.contains("email VARCHAR(100) UNIQUE NOT NULL"));
        assert!(ddl.contains("is_active BOOLEAN DEFAULT FALSE"));
    }

    #[tokio::test]
    async fn fresh_cluster_is_fully_provisioned() {
        let cluster = FakeCluster::new(ADMIN_PW);
        let mut mgr = admin_manager(&cluster).await;
        let provisioner = DatabaseProvisioner::new(&settings());

        let creds = provisioner
            .provision(&mut mgr, &request("svc-pw", "Admin@Example.com", "Admin"))
            .await
            .unwrap();

        assert_eq!(creds.database_name, "oddm_toolkit_db");
        assert_eq!(creds.service_role, "oddm_admin");
        assert_eq!(creds.service_password, "svc-pw");

        assert!(cluster.has_database("oddm_toolkit_db"));
        assert_eq!(cluster.role_password("oddm_admin").as_deref(), Some("svc-pw"));
        assert_eq!(
            cluster.schema_owner("oddm_toolkit_db").as_deref(),
            Some("oddm_admin")
        );

        let users: Vec<FakeUser> = cluster.users("oddm_toolkit_db");
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].username.as_deref(), Some("admin"));
        assert_eq!(users[0].email, "admin@example.com");
        assert!(users[0].is_admin && users[0].is_active);
        assert!(users[0].password_hash.starts_with("$argon2id$"));

        assert!(mgr.current_connection().is_none());
        assert_eq!(cluster.open_sessions(), 0);
        assert_eq!(cluster.max_open_sessions(), 1);
    }

    #[tokio::test]
    async fn second_run_with_same_inputs_fails_only_at_user_insert() {
        let cluster = FakeCluster::new(ADMIN_PW);
        let provisioner = DatabaseProvisioner::new(&settings());
        let req = request("svc-pw", "admin@example.com", "admin");

        let mut mgr = admin_manager(&cluster).await;
        provisioner.provision(&mut mgr, &req).await.unwrap();

        let mut mgr = admin_manager(&cluster).await;
        let err = provisioner.provision(&mut mgr, &req).await.unwrap_err();
        assert!(
            matches!(
                err,
                ProvisionError::DirectoryConflict(ConflictKind::DuplicateBoth)
            ),
            "unexpected error: {err:?}"
        );
        assert_eq!(err.code(), Some("ERR-USR-001"));

        // Infrastructure untouched, connection released.
        assert!(cluster.has_database("oddm_toolkit_db"));
        assert_eq!(cluster.users("oddm_toolkit_db").len(), 1);
        assert!(mgr.current_connection().is_none());
        assert_eq!(cluster.max_open_sessions(), 1);
    }

    #[tokio::test]
    async fn existing_database_with_other_password_is_already_provisioned() {
        let cluster = FakeCluster::new(ADMIN_PW);
        let provisioner = DatabaseProvisioner::new(&settings());

        let mut mgr = admin_manager(&cluster).await;
        provisioner
            .provision(&mut mgr, &request("P1", "admin@example.com", "admin"))
            .await
            .unwrap();

        let mut mgr = admin_manager(&cluster).await;
        let err = provisioner
            .provision(&mut mgr, &request("P2", "other@example.com", "other"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::AlreadyProvisioned));
        assert_eq!(err.code(), Some("ERR-ODDM-STUP-001"));
        assert!(mgr.is_connected_as(Identity::Admin, "oddm_toolkit_db"));
        assert_eq!(cluster.role_password("oddm_admin").as_deref(), Some("P1"));
        assert_eq!(cluster.max_open_sessions(), 1);
    }

    #[tokio::test]
    async fn pre_existing_role_on_new_database_is_rejected() {
        let cluster = FakeCluster::new(ADMIN_PW);
        cluster.add_role("oddm_admin", "left-over");
        let provisioner = DatabaseProvisioner::new(&settings());

        let mut mgr = admin_manager(&cluster).await;
        let err = provisioner
            .provision(&mut mgr, &request("fresh", "admin@example.com", "admin"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::ServiceRoleRejected));
        assert_eq!(err.code(), Some("ERR-ODDM-STUP-002"));
        assert!(mgr.is_connected_as(Identity::Admin, "oddm_toolkit_db"));
        assert!(cluster.users("oddm_toolkit_db").is_empty());
    }

    #[tokio::test]
    async fn provisioning_requires_an_admin_session() {
        let cluster = FakeCluster::new(ADMIN_PW);
        let provisioner = DatabaseProvisioner::new(&settings());
        let mut mgr = ConnectionManager::new(cluster.connector(), "localhost", 5432);

        let err = provisioner
            .provision(&mut mgr, &request("svc", "a@example.com", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NotConnected));
        assert!(!cluster.has_database("oddm_toolkit_db"));
    }

    #[tokio::test]
    async fn infrastructure_failure_is_fatal_and_not_rolled_back() {
        let cluster = FakeCluster::new(ADMIN_PW);
        cluster.fail_operation("grant_schema_privileges");
        let provisioner = DatabaseProvisioner::new(&settings());

        let mut mgr = admin_manager(&cluster).await;
        let err = provisioner
            .provision(&mut mgr, &request("svc", "a@example.com", "a"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::Infrastructure {
                step: ProvisionStep::GrantSchema,
                ..
            }
        ));
        assert!(cluster.has_database("oddm_toolkit_db"));
        assert!(cluster.role_password("oddm_admin").is_some());
    }

    #[test]
    fn debug_output_redacts_passwords() {
        let req = request("svc-secret", "a@example.com", "a");
        assert!(!format!("{:?}", req).contains("svc-secret"));

        let creds = ProvisionedCredentials {
            database_name: "oddm_toolkit_db".into(),
            service_role: "oddm_admin".into(),
            service_password: "svc-secret".into(),
        };
        assert!(!format!("{:?}", creds).contains("svc-secret"));
    }
}
