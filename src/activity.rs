//! Append-only activity journal.
//!
//! The router records every call it forwards: what ran, with which
//! arguments, and how it ended. The journal exists so a failed fan-out can
//! be reviewed and replayed by an operator; it must never take the router
//! down with it, so implementations swallow their own I/O errors after
//! logging them.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_yaml::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::warn;

use crate::codec;
use crate::result::CallResult;

/// Event severities stored in the journal.
pub mod level {
    pub const ERROR: i64 = 0;
    pub const WARN: i64 = 1;
    pub const INFO: i64 = 2;
}

const CREATE_EVENTS: &str = r"
CREATE TABLE IF NOT EXISTS events (
    eventtime INTEGER,
    type      INTEGER,
    action    TEXT,
    arguments TEXT,
    status    INTEGER,
    message   TEXT
);
";

const INSERT_EVENT: &str = r"
INSERT INTO events (eventtime, type, action, arguments, status, message)
VALUES (?, ?, ?, ?, ?, ?);
";

/// Sink for per-call activity records.
#[async_trait]
pub trait ActivityStream: Send + Sync {
    /// Records one call. `action_id` is `method:manager` (or `method:any`
    /// when no manager was reached). Implementations log and swallow their
    /// own failures.
    async fn record(&self, action_id: &str, params: &Value, result: &CallResult);
}

/// Journal used when recording is configured off (`$NONE`).
pub struct NullActivityStream;

#[async_trait]
impl ActivityStream for NullActivityStream {
    async fn record(&self, _action_id: &str, _params: &Value, _result: &CallResult) {}
}

/// SQLite-backed journal. The `events` table is created on first use.
pub struct SqliteActivityStream {
    pool: SqlitePool,
}

impl SqliteActivityStream {
    /// Opens (and if needed creates) the journal database at `path`.
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(CREATE_EVENTS).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn now_unix_secs() -> i64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl ActivityStream for SqliteActivityStream {
    async fn record(&self, action_id: &str, params: &Value, result: &CallResult) {
        let arguments =
            codec::encode(params).unwrap_or_else(|_| format!("{params:?}"));
        let (event_type, status, message) = if result.is_success() {
            (level::INFO, 0, String::new())
        } else {
            let message = codec::encode(&result.response)
                .unwrap_or_else(|_| format!("{:?}", result.response));
            (level::ERROR, result.status, message)
        };

        let insert = sqlx::query(INSERT_EVENT)
            .bind(Self::now_unix_secs())
            .bind(event_type)
            .bind(action_id)
            .bind(arguments)
            .bind(status)
            .bind(message)
            .execute(&self.pool)
            .await;
        if let Err(err) = insert {
            warn!(action_id, "could not journal activity: {}", err);
        }
    }
}
