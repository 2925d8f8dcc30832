use sqlx::SqlitePool;

use crate::{AppError, AppResult};

/// Bumped whenever the shipped schema changes shape; stamped into
/// `PRAGMA user_version` and recorded in backup manifests.
pub const SCHEMA_VERSION: i64 = 1;

/// Tables every valid Parlance database must contain. Backup validation
/// refuses snapshots missing any of these.
pub const CORE_TABLES: [&str; 4] = ["conversations", "messages", "attachments", "app_settings"];

const STATEMENTS: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS conversations (
        id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY,
        conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        sender TEXT NOT NULL,
        body TEXT NOT NULL,
        sent_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages(conversation_id, sent_at)",
    "CREATE TABLE IF NOT EXISTS attachments (
        id INTEGER PRIMARY KEY,
        message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        file_name TEXT NOT NULL,
        mime_type TEXT,
        size_bytes INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS app_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_conversations_updated
        ON conversations(updated_at)",
];

/// Create any missing tables and stamp the schema version. Idempotent.
pub async fn apply(pool: &SqlitePool) -> AppResult<()> {
    for sql in STATEMENTS {
        sqlx::query(sql).execute(pool).await.map_err(|err| {
            AppError::from(err).with_context("operation", "apply_schema")
        })?;
    }
    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))
        .execute(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "stamp_user_version"))?;
    Ok(())
}

/// The database's stamped schema version (`PRAGMA user_version`).
pub async fn user_version(pool: &SqlitePool) -> AppResult<i64> {
    sqlx::query_scalar::<_, i64>("PRAGMA user_version;")
        .fetch_one(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "read_user_version"))
}

/// Full schema as a single batch, for scratch connections in tests.
#[cfg(test)]
pub(crate) fn bootstrap_batch() -> String {
    let mut batch = STATEMENTS.join(";\n");
    batch.push(';');
    batch
}
