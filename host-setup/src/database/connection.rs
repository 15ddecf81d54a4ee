// Privileged database connection management
//
// The wizard talks to PostgreSQL with two identities: the administrative role supplied by the
// operator and the restricted service role it creates. A PostgreSQL session cannot change its
// login role, so every identity switch is a full close + reconnect. `ConnectionManager` owns the
// single live session and records which identity opened it.
//
// The `DbConnector` / `DbSession` traits keep the provisioning sequence testable without a
// running server.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::database::provisioning::{
    postgres_alter_schema_owner_stmt, postgres_create_db_stmt, postgres_create_role_stmt,
    postgres_create_users_table_stmt, postgres_grant_database_stmt, postgres_grant_schema_stmt,
    qualified_table,
};
use crate::database::users::{UserRow, USERS_TABLE};
use crate::utils::logging::mask_connection_string;

// =============================================================================
// Errors and credentials
// =============================================================================

/// Error returned by connection attempts.
/// Keeps user-friendly messages separate from internal details.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{user_message}")]
pub struct ConnectError {
    /// User-friendly message (safe to show in UI)
    pub user_message: String,
    /// Internal details for logging (never contains the password)
    pub internal_details: String,
}

/// A login role and its password. Only lives in memory.
#[derive(Clone)]
pub struct Credential {
    pub role: String,
    password: String,
}

impl Credential {
    pub fn new(role: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("role", &self.role)
            .field("password", &"***")
            .finish()
    }
}

/// Which identity a session was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Admin,
    Service,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Admin => f.write_str("admin"),
            Identity::Service => f.write_str("service"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub credential: Credential,
}

impl ConnectTarget {
    /// Loggable description of the target; the password is never included.
    pub fn describe(&self) -> String {
        mask_connection_string(&format!(
            "host={} port={} user={} dbname={}",
            self.host, self.port, self.credential.role, self.database
        ))
    }
}

// =============================================================================
// Connector / session seams
// =============================================================================

/// Opens sessions. Production code uses `PgConnector`; tests use an in-memory cluster.
#[async_trait]
pub trait DbConnector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn DbSession>, ConnectError>;
}

/// One open database session and the statements the setup wizard runs over it.
#[async_trait]
pub trait DbSession: Send {
    async fn database_exists(&mut self, database: &str) -> Result<bool>;
    async fn create_database(&mut self, database: &str) -> Result<()>;
    async fn role_exists(&mut self, role: &str) -> Result<bool>;
    async fn create_login_role(&mut self, role: &str, password: &str) -> Result<()>;
    async fn grant_database_privileges(&mut self, database: &str, role: &str) -> Result<()>;
    async fn grant_schema_privileges(&mut self, schema: &str, role: &str) -> Result<()>;
    async fn set_schema_owner(&mut self, schema: &str, role: &str) -> Result<()>;
    async fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool>;
    async fn create_users_table(&mut self, schema: &str) -> Result<()>;
    async fn find_user_by_username(&mut self, schema: &str, username: &str) -> Result<Option<i64>>;
    async fn find_user_by_email(&mut self, schema: &str, email: &str) -> Result<Option<i64>>;
    async fn insert_user(&mut self, schema: &str, row: &UserRow) -> Result<i64>;
    async fn admin_user_exists(&mut self, schema: &str) -> Result<bool>;
    /// Terminate the session. Further calls fail.
    async fn close(&mut self) -> Result<()>;
}

// =============================================================================
// PostgreSQL implementation
// =============================================================================

pub struct PgConnector {
    timeout: Duration,
}

impl PgConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DbConnector for PgConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn DbSession>, ConnectError> {
        // pgpass and PG* env defaults are ignored: only the operator's password may authenticate.
        let options = PgConnectOptions::new_without_pgpass()
            .host(&target.host)
            .port(target.port)
            .username(&target.credential.role)
            .password(target.credential.password())
            .database(&target.database)
            .application_name("oddm-host-setup");

        match timeout(self.timeout, PgConnection::connect_with(&options)).await {
            Ok(Ok(conn)) => Ok(Box::new(PgSession { conn: Some(conn) })),
            Ok(Err(e)) => {
                let user_message = match &e {
                    sqlx::Error::Io(_) | sqlx::Error::Tls(_) => format!(
                        "Unable to reach PostgreSQL at {}:{}. Check that the server is running.",
                        target.host, target.port
                    ),
                    _ => "Incorrect password. Please try again.".to_string(),
                };
                Err(ConnectError {
                    user_message,
                    internal_details: format!("Connection error for {}: {}", target.describe(), e),
                })
            }
            Err(_) => Err(ConnectError {
                user_message: "Connection timed out. Check that PostgreSQL is running and reachable."
                    .to_string(),
                internal_details: format!(
                    "Connection attempt to {} timed out after {:?}",
                    target.describe(),
                    self.timeout
                ),
            }),
        }
    }
}

pub struct PgSession {
    conn: Option<PgConnection>,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Database session is already closed"))
    }

    /// DDL goes over the simple query protocol; CREATE DATABASE cannot be prepared.
    async fn execute_ddl(&mut self, stmt: &str) -> Result<()> {
        let conn = self.conn()?;
        sqlx::Executor::execute(conn, sqlx::raw_sql(stmt)).await?;
        Ok(())
    }
}

#[async_trait]
impl DbSession for PgSession {
    async fn database_exists(&mut self, database: &str) -> Result<bool> {
        let conn = self.conn()?;
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(database)
            .fetch_one(conn)
            .await
            .context("Failed to query pg_database")
    }

    async fn create_database(&mut self, database: &str) -> Result<()> {
        self.execute_ddl(&postgres_create_db_stmt(database, None))
            .await
            .context("CREATE DATABASE failed")
    }

    async fn role_exists(&mut self, role: &str) -> Result<bool> {
        let conn = self.conn()?;
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM pg_roles WHERE rolname = $1)")
            .bind(role)
            .fetch_one(conn)
            .await
            .context("Failed to query pg_roles")
    }

    async fn create_login_role(&mut self, role: &str, password: &str) -> Result<()> {
        self.execute_ddl(&postgres_create_role_stmt(role, password))
            .await
            .context("CREATE ROLE failed")
    }

    async fn grant_database_privileges(&mut self, database: &str, role: &str) -> Result<()> {
        self.execute_ddl(&postgres_grant_database_stmt(database, role))
            .await
            .context("GRANT ON DATABASE failed")
    }

    async fn grant_schema_privileges(&mut self, schema: &str, role: &str) -> Result<()> {
        self.execute_ddl(&postgres_grant_schema_stmt(schema, role))
            .await
            .context("GRANT ON SCHEMA failed")
    }

    async fn set_schema_owner(&mut self, schema: &str, role: &str) -> Result<()> {
        self.execute_ddl(&postgres_alter_schema_owner_stmt(schema, role))
            .await
            .context("ALTER SCHEMA OWNER failed")
    }

    async fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool> {
        let conn = self.conn()?;
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(schema)
        .bind(table)
        .fetch_one(conn)
        .await
        .context("Failed to query information_schema.tables")
    }

    async fn create_users_table(&mut self, schema: &str) -> Result<()> {
        self.execute_ddl(&postgres_create_users_table_stmt(schema))
            .await
            .context("CREATE TABLE users failed")
    }

    async fn find_user_by_username(&mut self, schema: &str, username: &str) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT id FROM {} WHERE LOWER(username) = LOWER($1) LIMIT 1",
            qualified_table(schema, USERS_TABLE)
        );
        let conn = self.conn()?;
        let id = sqlx::query_scalar::<_, i32>(&sql)
            .bind(username)
            .fetch_optional(conn)
            .await
            .context("Failed to look up user by username")?;
        Ok(id.map(i64::from))
    }

    async fn find_user_by_email(&mut self, schema: &str, email: &str) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT id FROM {} WHERE LOWER(email) = LOWER($1) LIMIT 1",
            qualified_table(schema, USERS_TABLE)
        );
        let conn = self.conn()?;
        let id = sqlx::query_scalar::<_, i32>(&sql)
            .bind(email)
            .fetch_optional(conn)
            .await
            .context("Failed to look up user by email")?;
        Ok(id.map(i64::from))
    }

    async fn insert_user(&mut self, schema: &str, row: &UserRow) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (username, email, password_hash, is_admin, is_active) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
            qualified_table(schema, USERS_TABLE)
        );
        let conn = self.conn()?;
        let id = sqlx::query_scalar::<_, i32>(&sql)
            .bind(row.username.as_deref())
            .bind(&row.email)
            .bind(&row.password_hash)
            .bind(row.is_admin)
            .bind(row.is_active)
            .fetch_one(conn)
            .await
            .context("INSERT INTO users failed")?;
        Ok(i64::from(id))
    }

    async fn admin_user_exists(&mut self, schema: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE is_admin = TRUE)",
            qualified_table(schema, USERS_TABLE)
        );
        let conn = self.conn()?;
        sqlx::query_scalar::<_, bool>(&sql)
            .fetch_one(conn)
            .await
            .context("Failed to check for an admin user")
    }

    async fn close(&mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => conn.close().await.context("Failed to close connection"),
            None => Ok(()),
        }
    }
}

// =============================================================================
// ConnectionManager
// =============================================================================

struct ActiveConnection {
    identity: Identity,
    role: String,
    database: String,
    session: Box<dyn DbSession>,
}

/// Owns at most one open session.
pub struct ConnectionManager {
    connector: Arc<dyn DbConnector>,
    host: String,
    port: u16,
    active: Option<ActiveConnection>,
    last_error: Option<ConnectError>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn DbConnector>, host: impl Into<String>, port: u16) -> Self {
        Self {
            connector,
            host: host.into(),
            port,
            active: None,
            last_error: None,
        }
    }

    /// Authenticate as `credential` against `database`.
    ///
    /// Any open session is closed before the attempt, so two sessions never coexist. A failed
    /// attempt therefore leaves the manager with no session at all, not the previous one; the
    /// error is kept in `last_error` and callers reconnect explicitly.
    pub async fn connect(
        &mut self,
        identity: Identity,
        credential: &Credential,
        database: &str,
    ) -> bool {
        self.close().await;

        let target = ConnectTarget {
            host: self.host.clone(),
            port: self.port,
            database: database.to_string(),
            credential: credential.clone(),
        };
        debug!(
            "[PHASE: connection] [STEP: connect] Connecting as {} ({})",
            identity,
            target.describe()
        );

        match self.connector.connect(&target).await {
            Ok(session) => {
                info!(
                    "[PHASE: connection] [STEP: connect] Connected as {} to '{}'",
                    identity, database
                );
                self.last_error = None;
                self.active = Some(ActiveConnection {
                    identity,
                    role: credential.role.clone(),
                    database: database.to_string(),
                    session,
                });
                true
            }
            Err(e) => {
                warn!(
                    "[PHASE: connection] [STEP: connect] {} login failed: {}",
                    identity, e.internal_details
                );
                self.last_error = Some(e);
                false
            }
        }
    }

    pub fn current_connection(&mut self) -> Option<&mut (dyn DbSession + 'static)> {
        match self.active.as_mut() {
            Some(active) => Some(active.session.as_mut()),
            None => None,
        }
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.active.as_ref().map(|a| a.identity)
    }

    pub fn current_database(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.database.as_str())
    }

    pub fn is_connected_as(&self, identity: Identity, database: &str) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.identity == identity && a.database == database)
    }

    pub fn last_error(&self) -> Option<&ConnectError> {
        self.last_error.as_ref()
    }

    /// Close the open session, if any. Close errors are logged, never returned.
    pub async fn close(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        match active.session.close().await {
            Ok(()) => debug!(
                "[PHASE: connection] [STEP: close] Closed {} session ({} on '{}')",
                active.identity, active.role, active.database
            ),
            Err(e) => warn!(
                "[PHASE: connection] [STEP: close] Error closing {} session: {:#}",
                active.identity, e
            ),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::fake::FakeCluster;

    fn manager(cluster: &FakeCluster) -> ConnectionManager {
        ConnectionManager::new(cluster.connector(), "localhost", 5432)
    }

    #[tokio::test]
    async fn successful_connect_tracks_identity_and_database() {
        let cluster = FakeCluster::new("admin-pw");
        let mut mgr = manager(&cluster);

        assert!(mgr.current_connection().is_none());
        assert!(
            mgr.connect(Identity::Admin, &Credential::new("postgres", "admin-pw"), "postgres")
                .await
        );
        assert_eq!(mgr.current_identity(), Some(Identity::Admin));
        assert_eq!(mgr.current_database(), Some("postgres"));
        assert!(mgr.is_connected_as(Identity::Admin, "postgres"));
        assert!(mgr.current_connection().is_some());
        assert!(mgr.last_error().is_none());
    }

    #[tokio::test]
    async fn failed_connect_returns_false_and_keeps_no_handle() {
        let cluster = FakeCluster::new("admin-pw");
        let mut mgr = manager(&cluster);

        assert!(
            !mgr.connect(Identity::Admin, &Credential::new("postgres", "nope"), "postgres")
                .await
        );
        assert!(mgr.current_connection().is_none());
        assert_eq!(mgr.current_identity(), None);

        let err = mgr.last_error().expect("error recorded");
        assert_eq!(err.to_string(), "Incorrect password. Please try again.");
        assert!(!err.internal_details.contains("nope"));
        assert_eq!(cluster.open_sessions(), 0);
    }

    #[tokio::test]
    async fn reconnect_closes_previous_session_first() {
        let cluster = FakeCluster::new("admin-pw");
        cluster.add_role("oddm_admin", "svc-pw");
        cluster.add_database("oddm_toolkit_db");
        let mut mgr = manager(&cluster);
        let admin = Credential::new("postgres", "admin-pw");

        assert!(mgr.connect(Identity::Admin, &admin, "postgres").await);
        assert!(mgr.connect(Identity::Admin, &admin, "oddm_toolkit_db").await);
        assert!(
            mgr.connect(
                Identity::Service,
                &Credential::new("oddm_admin", "svc-pw"),
                "oddm_toolkit_db"
            )
            .await
        );

        assert_eq!(mgr.current_identity(), Some(Identity::Service));
        assert_eq!(cluster.open_sessions(), 1);
        assert_eq!(cluster.max_open_sessions(), 1);
    }

    #[tokio::test]
    async fn failed_reconnect_drops_the_previous_session() {
        let cluster = FakeCluster::new("admin-pw");
        cluster.add_role("oddm_admin", "svc-pw");
        cluster.add_database("oddm_toolkit_db");
        let mut mgr = manager(&cluster);

        assert!(
            mgr.connect(Identity::Admin, &Credential::new("postgres", "admin-pw"), "postgres")
                .await
        );
        assert!(
            !mgr.connect(
                Identity::Service,
                &Credential::new("oddm_admin", "wrong"),
                "oddm_toolkit_db"
            )
            .await
        );

        assert_eq!(mgr.current_identity(), None);
        assert!(!mgr.is_connected_as(Identity::Admin, "postgres"));
        assert!(mgr.current_connection().is_none());
        assert!(mgr.last_error().is_some());
        assert_eq!(cluster.open_sessions(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let cluster = FakeCluster::new("admin-pw");
        let mut mgr = manager(&cluster);
        assert!(
            mgr.connect(Identity::Admin, &Credential::new("postgres", "admin-pw"), "postgres")
                .await
        );

        mgr.close().await;
        mgr.close().await;
        assert!(mgr.current_connection().is_none());
        assert_eq!(cluster.open_sessions(), 0);
    }

    #[test]
    fn credential_debug_hides_password() {
        let cred = Credential::new("postgres", "hunter2");
        let dbg = format!("{:?}", cred);
        assert!(dbg.contains("postgres"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn target_description_never_contains_password() {
        let target = ConnectTarget {
            host: "localhost".into(),
            port: 5432,
            database: "oddm_toolkit_db".into(),
            credential: Credential::new("oddm_admin", "PASSWORD_SHOULD_BE_REDACTED"),
        };
        let described = target.describe();
        assert!(described.contains("host=localhost"));
        assert!(described.contains("dbname=oddm_toolkit_db"));
        assert!(!described.contains("PASSWORD_SHOULD_BE_REDACTED"));
    }

    #[test]
    fn connect_error_display_is_user_friendly() {
        let err = ConnectError {
            user_message: "Connection refused by server.".to_string(),
            internal_details: "tcp connect failed: errno=111".to_string(),
        };

        let displayed = format!("{}", err);
        assert_eq!(displayed, "Connection refused by server.");
        assert!(!displayed.contains("errno"));
    }

    #[test]
    fn pg_session_is_a_sendable_db_session() {
        fn assert_send<T: Send>() {}
        fn boxed(session: PgSession) -> Box<dyn DbSession> {
            Box::new(session)
        }
        assert_send::<PgSession>();
        assert_send::<Box<dyn DbSession>>();
        let _ = boxed;
    }

    #[test]
    fn connect_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConnectError>();
    }
}
