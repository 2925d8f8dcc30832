use std::fs::{self, File};
use std::io;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::paths::sidecar_path;
use crate::{AppError, AppResult};

/// Open the live database pool in WAL mode with the app's standard pragmas.
pub async fn open_pool(db_path: &Path) -> AppResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_db_parent_dir")
                .with_context("path", parent.display().to_string())
        })?;
    }

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_pool")
                .with_context("path", db_path.display().to_string())
        })?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &SqlitePool) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let sync: (i64,) = sqlx::query_as("PRAGMA synchronous;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "parlance",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        synchronous = %sync.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "parlance",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalCheckpointStats {
    pub busy: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// Flush every committed WAL frame into the main database file.
///
/// Backups copy the main file's bytes, so they must not begin until this
/// completes. An error here aborts the backup; an incomplete checkpoint
/// (busy frames remaining) is logged and tolerated.
pub async fn checkpoint_full(pool: &SqlitePool) -> AppResult<WalCheckpointStats> {
    let (busy, log_frames, checkpointed_frames) =
        sqlx::query_as::<_, (i64, i64, i64)>("PRAGMA wal_checkpoint(FULL);")
            .fetch_one(pool)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "wal_checkpoint"))?;

    let stats = WalCheckpointStats {
        busy,
        log_frames,
        checkpointed_frames,
    };
    if stats.busy > 0 {
        tracing::warn!(
            target: "parlance",
            busy = stats.busy,
            log_frames = stats.log_frames,
            checkpointed_frames = stats.checkpointed_frames,
            "wal_checkpoint_incomplete"
        );
    }
    Ok(stats)
}

/// Write a file through a temp name + rename so readers never observe a
/// half-written payload.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let tmp = sidecar_path(path, ".tmp");
    fs::write(&tmp, bytes).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_atomic_tmp")
            .with_context("path", tmp.display().to_string())
    })?;
    sync_file(&tmp).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "sync_atomic_tmp")
            .with_context("path", tmp.display().to_string())
    })?;
    fs::rename(&tmp, path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_atomic_rename")
            .with_context("from", tmp.display().to_string())
            .with_context("to", path.display().to_string())
    })?;
    if let Some(parent) = path.parent() {
        sync_dir(parent).ok();
    }
    Ok(())
}

pub(crate) fn sync_file(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

pub(crate) fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}
