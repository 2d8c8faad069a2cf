//! Local SQLite database shared by the durable queue and play history.

use std::{path::Path, time::Duration};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::error::{Error, Result};

/// Opens the database at `path`, creating it if it does not exist.
///
/// One connection serializes every write, so rows are inserted in the
/// order they are handed in.
///
/// # Errors
///
/// Will return `Err` if the database cannot be opened or created.
pub async fn open(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let path = path.as_ref();
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    debug!("opened database {}", path.display());

    Ok(pool)
}

/// SQLite integers are signed.
pub(crate) fn to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|e| Error::out_of_range(format!("{value}: {e}")))
}

pub(crate) fn from_sql(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|e| Error::data_loss(format!("{value}: {e}")))
}

/// An in-memory database that lives as long as the pool.
#[cfg(test)]
pub(crate) async fn memory() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}
