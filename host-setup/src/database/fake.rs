// In-memory PostgreSQL stand-in for tests.
//
// Models just enough of a cluster for the setup flow: login roles with passwords, databases with
// a `public` schema owner and an optional users table, and session accounting so tests can
// assert that no two sessions are ever open at once.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::database::connection::{ConnectError, ConnectTarget, DbConnector, DbSession};
use crate::database::users::{UserRow, EMAIL_MAX_LEN, USERNAME_MAX_LEN};

const SUPERUSER: &str = "postgres";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeUser {
    pub id: i64,
    pub username: Option<String>,
    pub email: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub is_active: bool,
}

#[derive(Debug, Default)]
struct FakeDatabase {
    schema_owner: String,
    database_grants: HashSet<String>,
    schema_grants: HashSet<String>,
    users: Option<Vec<FakeUser>>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct Cluster {
    roles: HashMap<String, String>,
    databases: HashMap<String, FakeDatabase>,
    open_sessions: usize,
    max_open_sessions: usize,
    connection_attempts: usize,
    failing: HashSet<&'static str>,
}

impl Cluster {
    fn new_database() -> FakeDatabase {
        FakeDatabase {
            schema_owner: SUPERUSER.to_string(),
            next_id: 1,
            ..Default::default()
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<Cluster>>,
}

impl FakeCluster {
    /// A cluster with the `postgres` superuser and the `postgres` maintenance database.
    pub fn new(superuser_password: &str) -> Self {
        let cluster = Self::default();
        {
            let mut c = cluster.lock();
            c.roles
                .insert(SUPERUSER.to_string(), superuser_password.to_string());
            c.databases
                .insert(SUPERUSER.to_string(), Cluster::new_database());
        }
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, Cluster> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connector(&self) -> Arc<dyn DbConnector> {
        Arc::new(FakeConnector {
            cluster: self.clone(),
        })
    }

    pub fn add_role(&self, role: &str, password: &str) {
        self.lock()
            .roles
            .insert(role.to_string(), password.to_string());
    }

    pub fn add_database(&self, name: &str) {
        self.lock()
            .databases
            .entry(name.to_string())
            .or_insert_with(Cluster::new_database);
    }

    /// Create the users table in `database` (if needed) and add an admin row.
    pub fn seed_admin(&self, database: &str, email: &str) {
        let mut c = self.lock();
        let db = c
            .databases
            .entry(database.to_string())
            .or_insert_with(Cluster::new_database);
        let id = db.next_id;
        db.next_id += 1;
        db.users.get_or_insert_with(Vec::new).push(FakeUser {
            id,
            username: None,
            email: email.to_string(),
            password_hash: String::new(),
            is_admin: true,
            is_active: false,
        });
    }

    /// Make every later call of the named `DbSession` operation fail.
    pub fn fail_operation(&self, op: &'static str) {
        self.lock().failing.insert(op);
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.lock().databases.contains_key(name)
    }

    pub fn has_users_table(&self, database: &str) -> bool {
        self.lock()
            .databases
            .get(database)
            .is_some_and(|db| db.users.is_some())
    }

    pub fn role_password(&self, role: &str) -> Option<String> {
        self.lock().roles.get(role).cloned()
    }

    pub fn schema_owner(&self, database: &str) -> Option<String> {
        self.lock()
            .databases
            .get(database)
            .map(|db| db.schema_owner.clone())
    }

    pub fn users(&self, database: &str) -> Vec<FakeUser> {
        self.lock()
            .databases
            .get(database)
            .and_then(|db| db.users.clone())
            .unwrap_or_default()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn max_open_sessions(&self) -> usize {
        self.lock().max_open_sessions
    }

    pub fn connection_attempts(&self) -> usize {
        self.lock().connection_attempts
    }
}

struct FakeConnector {
    cluster: FakeCluster,
}

#[async_trait]
impl DbConnector for FakeConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn DbSession>, ConnectError> {
        let mut c = self.cluster.lock();
        c.connection_attempts += 1;

        let role = &target.credential.role;
        let authenticated = c
            .roles
            .get(role)
            .is_some_and(|pw| pw == target.credential.password());
        if !authenticated {
            return Err(ConnectError {
                user_message: "Incorrect password. Please try again.".to_string(),
                internal_details: format!("password authentication failed for user \"{}\"", role),
            });
        }
        if !c.databases.contains_key(&target.database) {
            return Err(ConnectError {
                user_message: "Incorrect password. Please try again.".to_string(),
                internal_details: format!("database \"{}\" does not exist", target.database),
            });
        }

        c.open_sessions += 1;
        c.max_open_sessions = c.max_open_sessions.max(c.open_sessions);
        Ok(Box::new(FakeSession {
            cluster: self.cluster.clone(),
            role: role.clone(),
            database: target.database.clone(),
            open: true,
        }))
    }
}

struct FakeSession {
    cluster: FakeCluster,
    role: String,
    database: String,
    open: bool,
}

impl FakeSession {
    /// Lock the cluster for one operation, honoring closed sessions and injected failures.
    fn begin(&self, op: &'static str) -> Result<MutexGuard<'_, Cluster>> {
        if !self.open {
            bail!("connection is closed");
        }
        let c = self.cluster.lock();
        if c.failing.contains(op) {
            bail!("injected failure in {}", op);
        }
        Ok(c)
    }

    fn is_superuser(&self) -> bool {
        self.role == SUPERUSER
    }

    fn require_superuser(&self, what: &str) -> Result<()> {
        if self.is_superuser() {
            Ok(())
        } else {
            Err(anyhow!("permission denied to {}", what))
        }
    }
}

fn current_db<'a>(c: &'a mut Cluster, name: &str) -> Result<&'a mut FakeDatabase> {
    c.databases
        .get_mut(name)
        .ok_or_else(|| anyhow!("database \"{}\" does not exist", name))
}

fn check_varchar(value: &str, width: usize) -> Result<()> {
    if value.chars().count() > width {
        bail!("value too long for type character varying({})", width);
    }
    Ok(())
}

fn users_table<'a>(c: &'a mut Cluster, name: &str) -> Result<&'a mut Vec<FakeUser>> {
    current_db(c, name)?
        .users
        .as_mut()
        .ok_or_else(|| anyhow!("relation \"users\" does not exist"))
}

#[async_trait]
impl DbSession for FakeSession {
    async fn database_exists(&mut self, database: &str) -> Result<bool> {
        let c = self.begin("database_exists")?;
        Ok(c.databases.contains_key(database))
    }

    async fn create_database(&mut self, database: &str) -> Result<()> {
        self.require_superuser("create database")?;
        let mut c = self.begin("create_database")?;
        if c.databases.contains_key(database) {
            bail!("database \"{}\" already exists", database);
        }
        c.databases
            .insert(database.to_string(), Cluster::new_database());
        Ok(())
    }

    async fn role_exists(&mut self, role: &str) -> Result<bool> {
        let c = self.begin("role_exists")?;
        Ok(c.roles.contains_key(role))
    }

    async fn create_login_role(&mut self, role: &str, password: &str) -> Result<()> {
        self.require_superuser("create role")?;
        let mut c = self.begin("create_login_role")?;
        if c.roles.contains_key(role) {
            bail!("role \"{}\" already exists", role);
        }
        c.roles.insert(role.to_string(), password.to_string());
        Ok(())
    }

    async fn grant_database_privileges(&mut self, database: &str, role: &str) -> Result<()> {
        self.require_superuser("grant database privileges")?;
        let mut c = self.begin("grant_database_privileges")?;
        if !c.roles.contains_key(role) {
            bail!("role \"{}\" does not exist", role);
        }
        current_db(&mut c, database)?
            .database_grants
            .insert(role.to_string());
        Ok(())
    }

    async fn grant_schema_privileges(&mut self, _schema: &str, role: &str) -> Result<()> {
        self.require_superuser("grant schema privileges")?;
        let database = self.database.clone();
        let mut c = self.begin("grant_schema_privileges")?;
        current_db(&mut c, &database)?
            .schema_grants
            .insert(role.to_string());
        Ok(())
    }

    async fn set_schema_owner(&mut self, _schema: &str, role: &str) -> Result<()> {
        self.require_superuser("alter schema owner")?;
        let database = self.database.clone();
        let mut c = self.begin("set_schema_owner")?;
        if !c.roles.contains_key(role) {
            bail!("role \"{}\" does not exist", role);
        }
        current_db(&mut c, &database)?.schema_owner = role.to_string();
        Ok(())
    }

    async fn table_exists(&mut self, _schema: &str, _table: &str) -> Result<bool> {
        let database = self.database.clone();
        let mut c = self.begin("table_exists")?;
        Ok(current_db(&mut c, &database)?.users.is_some())
    }

    async fn create_users_table(&mut self, _schema: &str) -> Result<()> {
        let database = self.database.clone();
        let superuser = self.is_superuser();
        let role = self.role.clone();
        let mut c = self.begin("create_users_table")?;
        let db = current_db(&mut c, &database)?;
        if !superuser && db.schema_owner != role && !db.schema_grants.contains(&role) {
            bail!("permission denied for schema public");
        }
        db.users.get_or_insert_with(Vec::new);
        Ok(())
    }

    async fn find_user_by_username(&mut self, _schema: &str, username: &str) -> Result<Option<i64>> {
        let database = self.database.clone();
        let mut c = self.begin("find_user_by_username")?;
        Ok(users_table(&mut c, &database)?
            .iter()
            .find(|u| {
                u.username
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(username))
            })
            .map(|u| u.id))
    }

    async fn find_user_by_email(&mut self, _schema: &str, email: &str) -> Result<Option<i64>> {
        let database = self.database.clone();
        let mut c = self.begin("find_user_by_email")?;
        Ok(users_table(&mut c, &database)?
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .map(|u| u.id))
    }

    async fn insert_user(&mut self, _schema: &str, row: &UserRow) -> Result<i64> {
        let database = self.database.clone();
        let mut c = self.begin("insert_user")?;
        let db = current_db(&mut c, &database)?;
        let id = db.next_id;
        let users = db
            .users
            .as_mut()
            .ok_or_else(|| anyhow!("relation \"users\" does not exist"))?;
        check_varchar(row.username.as_deref().unwrap_or(""), USERNAME_MAX_LEN)?;
        check_varchar(&row.email, EMAIL_MAX_LEN)?;
        // UNIQUE constraints
        if users.iter().any(|u| u.email == row.email)
            || users
                .iter()
                .any(|u| u.username.is_some() && u.username == row.username)
        {
            bail!("duplicate key value violates unique constraint");
        }
        users.push(FakeUser {
            id,
            username: row.username.clone(),
            email: row.email.clone(),
            password_hash: row.password_hash.clone(),
            is_admin: row.is_admin,
            is_active: row.is_active,
        });
        db.next_id += 1;
        Ok(id)
    }

    async fn admin_user_exists(&mut self, _schema: &str) -> Result<bool> {
        let database = self.database.clone();
        let mut c = self.begin("admin_user_exists")?;
        Ok(users_table(&mut c, &database)?.iter().any(|u| u.is_admin))
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            let mut c = self.cluster.lock();
            c.open_sessions = c.open_sessions.saturating_sub(1);
        }
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if self.open {
            let mut c = self.cluster.lock();
            c.open_sessions = c.open_sessions.saturating_sub(1);
        }
    }
}
