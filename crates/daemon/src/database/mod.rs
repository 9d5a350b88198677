pub mod models;

use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Handle on the policy store.
///
/// All persistent entities (key-users, signing conditions, policies,
/// tokens, pending requests, the audit log) live here. SQLite runs in
/// WAL mode with a single logical writer; mutating operations serialise
/// through the pool.
#[derive(Clone, Debug)]
pub struct Database(SqlitePool);

impl Database {
    pub async fn connect(database_url: &url::Url) -> Result<Self, DatabaseSetupError> {
        if database_url.scheme() == "sqlite" {
            let db = connect_sqlite(database_url).await?;
            migrate_sqlite(&db).await?;
            return Ok(Database::new(db));
        }

        Err(DatabaseSetupError::UnknownDbType(
            database_url.scheme().to_string(),
        ))
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self(pool)
    }

    /// Cheap readiness probe for the health endpoint.
    pub async fn is_ready(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.0).await?;
        Ok(())
    }
}

impl Deref for Database {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

async fn connect_sqlite(url: &url::Url) -> Result<SqlitePool, DatabaseSetupError> {
    let options = SqliteConnectOptions::from_str(url.as_str())
        .map_err(DatabaseSetupError::Unavailable)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(DatabaseSetupError::Unavailable)
}

async fn migrate_sqlite(pool: &SqlitePool) -> Result<(), DatabaseSetupError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(DatabaseSetupError::MigrationFailed)
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseSetupError {
    #[error("could not apply policy store migrations: {0}")]
    MigrationFailed(sqlx::migrate::MigrateError),

    #[error("policy store is unreachable: {0}")]
    Unavailable(sqlx::Error),

    #[error("unsupported database scheme '{0}', only sqlite is supported")]
    UnknownDbType(String),
}
