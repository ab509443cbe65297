//! Per-session Postgres databases on a shared administrative server.

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Url;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;

use super::error::BackendError;

/// SQLSTATE for `duplicate_database`.
const DUPLICATE_DATABASE: &str = "42P04";

/// SQLSTATE for `unique_violation`, raised on the catalog when two
/// `CREATE DATABASE` statements for the same name race.
const UNIQUE_VIOLATION: &str = "23505";

/// Administrative operations on the Postgres server.
#[async_trait]
pub trait PostgresAdmin: Send + Sync {
    async fn database_exists(&self, name: &str) -> Result<bool, BackendError>;
    /// Create the database. An already-existing database is not an error.
    async fn create_database(&self, name: &str) -> Result<(), BackendError>;
    /// Terminate every other backend connected to the database.
    async fn terminate_connections(&self, name: &str) -> Result<u64, BackendError>;
    /// Drop the database if it exists. Returns whether it existed.
    async fn drop_database(&self, name: &str) -> Result<bool, BackendError>;
    /// URL with the administrative credentials pointed at `name`.
    fn connection_url(&self, name: &str) -> Result<String, BackendError>;
}

/// Point an administrative connection URL at another database.
pub fn database_url(admin_url: &str, database: &str) -> Result<String, BackendError> {
    let mut url = Url::parse(admin_url).map_err(|e| BackendError::Url(e.to_string()))?;
    if !matches!(url.scheme(), "postgres" | "postgresql") {
        return Err(BackendError::Url(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    url.set_path(&format!("/{}", database));
    Ok(url.to_string())
}

/// Quote an identifier for interpolation into DDL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Whether a database error means the database already exists.
fn is_already_exists(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(DUPLICATE_DATABASE) | Some(UNIQUE_VIOLATION)
        ),
        _ => false,
    }
}

/// [`PostgresAdmin`] backed by an sqlx pool on the administrative database.
#[derive(Debug, Clone)]
pub struct SqlxPostgresAdmin {
    pool: PgPool,
    admin_url: String,
    statement_timeout: Duration,
}

impl SqlxPostgresAdmin {
    /// Build the admin pool. Connections are opened lazily, so a server that
    /// is down at startup only fails the calls that need it.
    pub fn connect_lazy(
        admin_url: &str,
        statement_timeout: Duration,
    ) -> Result<Self, BackendError> {
        // Validate early so a bad URL is a startup error
        database_url(admin_url, "postgres")?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(statement_timeout)
            .connect_lazy(admin_url)?;

        Ok(Self {
            pool,
            admin_url: admin_url.to_string(),
            statement_timeout,
        })
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.statement_timeout, fut).await {
            Ok(result) => result.map_err(BackendError::from),
            Err(_) => Err(BackendError::Timeout {
                operation: operation.to_string(),
                timeout: self.statement_timeout,
            }),
        }
    }
}

#[async_trait]
impl PostgresAdmin for SqlxPostgresAdmin {
    async fn database_exists(&self, name: &str) -> Result<bool, BackendError> {
        let row: Option<(i32,)> = self
            .timed(
                "database lookup",
                sqlx::query_as("SELECT 1 FROM pg_database WHERE datname = $1")
                    .bind(name)
                    .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.is_some())
    }

    async fn create_database(&self, name: &str) -> Result<(), BackendError> {
        let sql = format!("CREATE DATABASE {}", quote_ident(name));
        match self
            .timed("create database", sqlx::query(&sql).execute(&self.pool))
            .await
        {
            Ok(_) => {
                info!("Created database {}", name);
                Ok(())
            }
            Err(BackendError::Database(ref e)) if is_already_exists(e) => {
                debug!("Database {} already exists", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn terminate_connections(&self, name: &str) -> Result<u64, BackendError> {
        let result = self
            .timed(
                "terminate connections",
                sqlx::query(
                    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                     WHERE datname = $1 AND pid <> pg_backend_pid()",
                )
                .bind(name)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }

    async fn drop_database(&self, name: &str) -> Result<bool, BackendError> {
        let existed = self.database_exists(name).await?;
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(name));
        self.timed("drop database", sqlx::query(&sql).execute(&self.pool))
            .await?;
        if existed {
            info!("Dropped database {}", name);
        }
        Ok(existed)
    }

    fn connection_url(&self, name: &str) -> Result<String, BackendError> {
        database_url(&self.admin_url, name)
    }
}
