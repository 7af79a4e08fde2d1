//! Database session and connection lifecycle.
//!
//! Every sqlmend run holds exactly one connection. Commands open it with
//! [`MySqlSession::connect`], drive their work through [`guarded`], and hand
//! the outcome to [`release`], which closes the connection exactly once on
//! success, on error and on panic.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::CatchUnwind;
use futures_util::FutureExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError};
use sqlx::Connection;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::time::Duration;

/// A database error as seen by the executor.
///
/// `number` is the MySQL server error number (e.g. 1060) when the failure came
/// from the server; client-side failures (I/O, protocol, decoding) have none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub number: Option<u16>,
    pub sqlstate: Option<String>,
    pub message: String,
}

impl DbError {
    #[cfg(test)]
    pub fn server(number: u16, sqlstate: &str, message: impl Into<String>) -> Self {
        Self {
            number: Some(number),
            sqlstate: Some(sqlstate.to_string()),
            message: message.into(),
        }
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self {
            number: None,
            sqlstate: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.number, self.sqlstate.as_deref()) {
            (Some(n), Some(state)) => write!(f, "ERROR {} ({}): {}", n, state, self.message),
            (Some(n), None) => write!(f, "ERROR {}: {}", n, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DbError {}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => Self {
                number: db
                    .try_downcast_ref::<MySqlDatabaseError>()
                    .map(|e| e.number()),
                sqlstate: db.code().map(|c| c.into_owned()),
                message: db.message().to_string(),
            },
            other => Self::client(other.to_string()),
        }
    }
}

/// One open connection. Statements run strictly in call order.
#[async_trait]
pub trait Session: Send + Sized {
    /// Execute one statement, returning the affected row count.
    async fn execute(&mut self, sql: &str) -> Result<u64, DbError>;

    /// Close the connection. Called exactly once per session by [`release`].
    async fn close(self) -> Result<(), DbError>;
}

/// Session backed by a single sqlx MySQL connection.
pub struct MySqlSession {
    conn: MySqlConnection,
}

impl MySqlSession {
    /// Open one connection, failing fast after `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let options = MySqlConnectOptions::from_str(url).map_err(|_| {
            anyhow::anyhow!(
                "Invalid MySQL connection URL: {}",
                crate::redact::redact_dsn(url)
            )
        })?;

        let conn = tokio::time::timeout(timeout, MySqlConnection::connect_with(&options))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Timed out after {}ms connecting to {}",
                    timeout.as_millis(),
                    crate::redact::redact_dsn(url)
                )
            })?
            .map_err(DbError::from)
            .context("Failed to connect to MySQL")?;

        Ok(Self { conn })
    }

    pub(crate) fn conn(&mut self) -> &mut MySqlConnection {
        &mut self.conn
    }
}

#[async_trait]
impl Session for MySqlSession {
    async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        // Text protocol: DDL and transaction control are not preparable everywhere.
        let conn: &mut MySqlConnection = &mut self.conn;
        let result = sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }

    async fn close(self) -> Result<(), DbError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Wrap session work so a panic is captured instead of skipping [`release`].
pub fn guarded<F: Future>(work: F) -> CatchUnwind<AssertUnwindSafe<F>> {
    AssertUnwindSafe(work).catch_unwind()
}

/// Close `session`, then return the work outcome.
///
/// A panic inside the work is resumed after the connection is closed. When the
/// work failed, a close failure is secondary and only the work error is returned.
pub async fn release<S: Session, T>(
    session: S,
    outcome: std::thread::Result<Result<T>>,
) -> Result<T> {
    let closed = session.close().await;
    match outcome {
        Err(panic) => std::panic::resume_unwind(panic),
        Ok(Err(err)) => Err(err),
        Ok(Ok(value)) => {
            closed.context("Failed to close database connection")?;
            Ok(value)
        }
    }
}
