pub mod messages;
pub mod threads;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::Row;
use std::sync::OnceLock;
use thiserror::Error;

pub type DbPool = sqlx::AnyPool;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
}

/// Backends the `Any` pool is used with. Each has its own migration set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEngine {
    Sqlite,
    Postgres,
}

impl DatabaseEngine {
    pub fn from_url(database_url: &str) -> Result<Self, sqlx::Error> {
        let scheme = database_url
            .trim()
            .split(':')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match scheme.as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(sqlx::Error::Configuration(
                format!("unsupported database URL '{database_url}'").into(),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

static ENGINE: OnceLock<DatabaseEngine> = OnceLock::new();

const SQLITE_PRAGMAS: [&str; 4] = [
    "PRAGMA journal_mode = WAL;",
    "PRAGMA foreign_keys = ON;",
    "PRAGMA busy_timeout = 5000;",
    "PRAGMA synchronous = NORMAL;",
];

/// Open a pool for `database_url`. The engine is picked from the URL scheme
/// and remembered for [`run_migrations`].
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    let engine = DatabaseEngine::from_url(database_url)?;
    let _ = ENGINE.set(engine);
    sqlx::any::install_default_drivers();

    let pool = AnyPoolOptions::new()
        .max_connections(max_connections.max(1))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if engine == DatabaseEngine::Sqlite {
                    for pragma in SQLITE_PRAGMAS {
                        sqlx::query(pragma).execute(&mut *conn).await?;
                    }
                }
                Ok(())
            })
        })
        .connect(database_url)
        .await?;
    tracing::debug!(engine = engine.as_str(), max_connections, "db: pool ready");
    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    let engine = ENGINE.get().copied().unwrap_or(DatabaseEngine::Sqlite);
    match engine {
        DatabaseEngine::Sqlite => sqlx::migrate!("./migrations").run(pool).await?,
        DatabaseEngine::Postgres => sqlx::migrate!("./migrations_pg").run(pool).await?,
    }
    tracing::info!(engine = engine.as_str(), "db: migrations applied");
    Ok(())
}

/// Millisecond RFC 3339 in UTC. Fixed width, so text order is time order.
pub(crate) fn datetime_to_db_text(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn datetime_from_db_text(value: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
        .map_err(|_| sqlx::Error::Protocol(format!("invalid datetime text '{value}'")))
}

/// Booleans come back as integers from SQLite and as `bool` from Postgres.
pub(crate) fn bool_from_any_row(row: &AnyRow, column: &str) -> Result<bool, sqlx::Error> {
    match row.try_get::<bool, _>(column) {
        Ok(value) => Ok(value),
        Err(err) => row
            .try_get::<i64, _>(column)
            .map(|raw| raw != 0)
            .or_else(|_| row.try_get::<i32, _>(column).map(|raw| raw != 0))
            .map_err(|_| err),
    }
}

#[cfg(test)]
pub(crate) async fn test_pool() -> DbPool {
    let pool = create_pool("sqlite::memory:", 1).await.expect("pool");
    run_migrations(&pool).await.expect("migrations");
    pool
}
