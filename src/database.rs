//! Embedded `SQLite` connection management.
//!
//! Pure configuration validation is separated from the I/O of opening the
//! pool and applying pragmas. Schema creation and additive migration belong
//! to the queue store ([`crate::bus::store`]), which owns its tables; this
//! module only hands out a tuned connection pool.
//!
//! The database must permit concurrent readers while serializing writers, so
//! WAL journaling is the default and every multi-statement store operation
//! runs inside a transaction.

use nutype::nutype;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Database-level errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Error from `SQLx`.
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// File system error creating the database directory.
    #[error("file system error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("configuration error: {field} - {reason}")]
    Configuration {
        /// Offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Result alias for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Validated path to the database file; must end in `.db`.
#[nutype(
    validate(predicate = |path| !path.as_os_str().is_empty() && path.extension().is_some_and(|ext| ext == "db")),
    derive(Clone, Debug, Eq, PartialEq)
)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Creates a validated database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty or does not end in `.db`.
    pub fn new<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        Self::try_new(path_buf).map_err(|_| DatabaseError::Configuration {
            field: "database_path".to_string(),
            reason: "path is empty or missing the .db extension".to_string(),
        })
    }

    /// The path as a `PathBuf`.
    #[must_use]
    pub fn as_path(&self) -> PathBuf {
        self.clone().into_inner()
    }

    /// Parent directory, if the path has one.
    #[must_use]
    pub fn parent_directory(&self) -> Option<PathBuf> {
        self.as_path().parent().map(Path::to_path_buf)
    }
}

impl std::fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Connection configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    path: DatabasePath,
    max_connections: u32,
    enable_wal_mode: bool,
}

impl DatabaseConfig {
    /// Creates a config with production defaults.
    #[must_use]
    pub fn new(path: DatabasePath) -> Self {
        Self {
            path,
            max_connections: 8,
            enable_wal_mode: true,
        }
    }

    /// Minimal settings for tests: a single connection, no WAL.
    #[must_use]
    pub fn for_testing(path: DatabasePath) -> Self {
        Self {
            path,
            max_connections: 1,
            enable_wal_mode: false,
        }
    }

    /// Sets the connection pool size.
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// The database path.
    #[must_use]
    pub fn path(&self) -> &DatabasePath {
        &self.path
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool size is zero.
    pub fn validate(&self) -> DatabaseResult<()> {
        if self.max_connections == 0 {
            return Err(DatabaseError::Configuration {
                field: "max_connections".to_string(),
                reason: "pool size must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    fn connect_options(&self) -> sqlx::sqlite::SqliteConnectOptions {
        use sqlx::ConnectOptions;
        use sqlx::sqlite::SqliteConnectOptions;

        let mut options = SqliteConnectOptions::new()
            .filename(self.path.as_path())
            .create_if_missing(true)
            .pragma("foreign_keys", "ON");

        if self.enable_wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        options.disable_statement_logging()
    }
}

/// Open connection pool with its configuration.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
    config: DatabaseConfig,
}

impl DatabaseConnection {
    /// Opens the database: validates config, creates the parent directory,
    /// connects the pool, and applies performance pragmas.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, directory creation, or connection
    /// fails.
    pub async fn initialize(config: DatabaseConfig) -> DatabaseResult<Self> {
        config.validate()?;

        if let Some(parent) = config.path().parent_directory() {
            tokio::fs::create_dir_all(&parent).await?;
        }

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(config.connect_options())
            .await?;

        Self::apply_settings(&pool).await?;
        info!(path = %config.path(), "database opened");

        Ok(Self { pool, config })
    }

    /// Opens an in-memory database for unit tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn in_memory() -> DatabaseResult<Self> {
        let options = sqlx::sqlite::SqliteConnectOptions::new().in_memory(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let config = DatabaseConfig::for_testing(DatabasePath::new("memory.db")?);
        Ok(Self { pool, config })
    }

    async fn apply_settings(pool: &SqlitePool) -> DatabaseResult<()> {
        // NORMAL is crash-safe under WAL and considerably faster than FULL.
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY")
            .execute(pool)
            .await?;
        // SQLite's busy handler covers writer contention between consumers.
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(pool)
            .await?;
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// The configuration this connection was opened with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn path_requires_db_extension() {
        assert!(DatabasePath::new("queues.db").is_ok());
        assert!(DatabasePath::new("queues.sqlite").is_err());
        assert!(DatabasePath::new("").is_err());
    }

    #[test]
    fn zero_pool_size_rejected() {
        let path = DatabasePath::new("queues.db").unwrap();
        let config = DatabaseConfig::new(path).with_max_connections(0);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn initialize_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("state").join("queues.db");
        let config = DatabaseConfig::for_testing(DatabasePath::new(&nested).unwrap());
        let connection = DatabaseConnection::initialize(config).await.unwrap();
        sqlx::query("SELECT 1")
            .execute(connection.pool())
            .await
            .unwrap();
        assert!(nested.exists());
    }
}
