//! Backup & recovery manager for the live chat database.
//!
//! Every public operation is total: failures come back inside the
//! returned value (`BackupResult`/`RestoreResult`/`bool`/empty list),
//! never as an `Err` or a panic, so results can be forwarded verbatim
//! across process boundaries.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use fs2::available_space;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task;

use crate::state::ConnectionHandle;
use crate::{db, paths, schema, AppError, AppResult};

pub mod catalog;
pub mod manifest;
pub mod validate;
pub mod writer;

use manifest::BackupManifest;

pub const DEFAULT_MAX_BACKUPS: usize = 10;
const HARD_MAX_BACKUPS: usize = 50;
const SAFETY_BACKUP_PREFIX: &str = "pre-restore-backup";
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const MAX_COUNT_ENV: &str = "PARLANCE_BACKUP_MAX_COUNT";
const FAKE_FREE_BYTES_ENV: &str = "PARLANCE_BACKUP_FAKE_FREE_BYTES";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupOptions {
    /// Target directory; defaults to `backups/` next to the live database.
    pub directory: Option<PathBuf>,
    /// Accepted for forward compatibility; backups are written uncompressed.
    pub compression: Option<bool>,
    pub include_wal: bool,
    pub include_shm: bool,
    pub max_backups: usize,
    pub auto_cleanup: bool,
    pub custom_file_name: Option<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            directory: None,
            compression: None,
            include_wal: true,
            include_shm: false,
            max_backups: DEFAULT_MAX_BACKUPS,
            auto_cleanup: true,
            custom_file_name: None,
        }
    }
}

impl BackupOptions {
    /// Defaults with environment overrides applied, clamped to sane bounds.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(max) = env::var(MAX_COUNT_ENV)
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
        {
            options.max_backups = max.min(HARD_MAX_BACKUPS);
        }
        options
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    pub create_backup_before_restore: bool,
    pub validate_integrity: bool,
    pub overwrite_existing: bool,
    pub restore_wal: bool,
    pub restore_shm: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            create_backup_before_restore: true,
            validate_integrity: true,
            overwrite_existing: false,
            restore_wal: false,
            restore_shm: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupResult {
    fn completed(file_path: String, size: u64, timestamp: String) -> Self {
        Self {
            success: true,
            file_path: Some(file_path),
            size: Some(size),
            timestamp: Some(timestamp),
            error: None,
        }
    }

    fn failed(error: &AppError) -> Self {
        Self {
            success: false,
            file_path: None,
            size: None,
            timestamp: None,
            error: Some(error.message().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_path: Option<String>,
    /// Path of the safety snapshot, when one was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RestoreResult {
    fn completed(restored_path: String, backup_created: Option<String>, timestamp: String) -> Self {
        Self {
            success: true,
            restored_path: Some(restored_path),
            backup_created,
            timestamp: Some(timestamp),
            error: None,
        }
    }

    fn failed(error: &AppError) -> Self {
        Self {
            success: false,
            restored_path: None,
            backup_created: None,
            timestamp: None,
            error: Some(error.message().to_string()),
        }
    }
}

/// One catalog entry, materialized on demand from the filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub id: String,
    pub timestamp: String,
    pub file_path: String,
    pub size: u64,
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub wal_included: bool,
    pub shm_included: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub total_backups: usize,
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_backup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_backup: Option<String>,
}

/// Orchestrates backup creation, restore, listing, retention and
/// validation for one live database.
///
/// Mutating operations are serialized through a single-slot async mutex;
/// two backups, a backup and a restore, or two restores never run
/// concurrently against the same instance.
pub struct BackupManager {
    connection: ConnectionHandle,
    db_path: PathBuf,
    defaults: BackupOptions,
    op_lock: Mutex<()>,
}

impl BackupManager {
    pub fn new(
        connection: ConnectionHandle,
        db_path: impl Into<PathBuf>,
        defaults: BackupOptions,
    ) -> Self {
        Self {
            connection,
            db_path: db_path.into(),
            defaults,
            op_lock: Mutex::new(()),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    fn effective_options(&self, overrides: Option<BackupOptions>) -> BackupOptions {
        overrides.unwrap_or_else(|| self.defaults.clone())
    }

    fn backup_dir(&self, options: &BackupOptions) -> AppResult<PathBuf> {
        match &options.directory {
            Some(dir) => Ok(dir.clone()),
            None => paths::default_backup_dir(&self.db_path),
        }
    }

    /// Snapshot the live database into the backup directory.
    pub async fn create_backup(&self, options: Option<BackupOptions>) -> BackupResult {
        let _guard = self.op_lock.lock().await;
        match self.create_backup_inner(self.effective_options(options)).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(target: "parlance", error = %err, "backup_failed");
                BackupResult::failed(&err)
            }
        }
    }

    async fn create_backup_inner(&self, options: BackupOptions) -> AppResult<BackupResult> {
        // no live connection means no file I/O at all
        let pool = self
            .connection
            .get()
            .ok_or_else(|| AppError::new("BACKUP/NOT_INITIALIZED", "Database not initialized"))?;

        // fold the WAL into the main file; a failed checkpoint aborts
        db::checkpoint_full(&pool)
            .await
            .map_err(|err| err.with_context("operation", "backup_checkpoint"))?;

        let db_version = schema::user_version(&pool)
            .await
            .map_err(|err| err.with_context("operation", "backup_user_version"))?;

        if options.compression.unwrap_or(false) {
            tracing::debug!(target: "parlance", "backup_compression_requested_unsupported");
        }

        let dir = self.backup_dir(&options)?;
        let db_path = self.db_path.clone();
        let prefix = options
            .custom_file_name
            .clone()
            .unwrap_or_else(|| catalog::DEFAULT_BACKUP_PREFIX.to_string());
        let include_wal = options.include_wal;
        let include_shm = options.include_shm;

        let written = {
            let dir = dir.clone();
            task::spawn_blocking(move || {
                write_backup_sync(&db_path, &dir, &prefix, include_wal, include_shm, db_version)
            })
            .await
            .map_err(|err| {
                AppError::new("BACKUP/TASK", "Backup task panicked")
                    .with_context("error", err.to_string())
            })??
        };

        if options.auto_cleanup && options.max_backups > 0 {
            let max = options.max_backups;
            let deleted = task::spawn_blocking(move || catalog::apply_retention_sync(&dir, max))
                .await
                .map_err(|err| {
                    AppError::new("BACKUP/TASK", "Retention task panicked")
                        .with_context("error", err.to_string())
                })?;
            if !deleted.is_empty() {
                tracing::info!(
                    target: "parlance",
                    count = deleted.len(),
                    "backup_retention_pruned"
                );
            }
        }

        tracing::info!(
            target: "parlance",
            path = %written.file_path,
            size = written.size,
            "backup_created"
        );
        Ok(BackupResult::completed(
            written.file_path,
            written.size,
            written.created_at,
        ))
    }

    /// Restore the live database from a backup file.
    ///
    /// Ordering is load-bearing: validate, snapshot, disconnect, swap.
    /// A validation failure leaves the live file set and the connection
    /// untouched. After a successful restore the connection slot stays
    /// empty; reopening is the caller's responsibility.
    pub async fn restore_from_backup(
        &self,
        backup_path: impl AsRef<Path>,
        options: Option<RestoreOptions>,
    ) -> RestoreResult {
        let _guard = self.op_lock.lock().await;
        let backup_path = backup_path.as_ref().to_path_buf();
        let options = options.unwrap_or_default();
        match self.restore_inner(&backup_path, &options).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(
                    target: "parlance",
                    error = %err,
                    path = %backup_path.display(),
                    "restore_failed"
                );
                RestoreResult::failed(&err)
            }
        }
    }

    async fn restore_inner(
        &self,
        backup_path: &Path,
        options: &RestoreOptions,
    ) -> AppResult<RestoreResult> {
        if options.validate_integrity {
            let candidate = backup_path.to_path_buf();
            task::spawn_blocking(move || validate::validate_file_sync(&candidate))
                .await
                .map_err(|err| {
                    AppError::new("RESTORE/TASK", "Validation task panicked")
                        .with_context("error", err.to_string())
                })?
                .map_err(|err| {
                    AppError::new(
                        "RESTORE/VALIDATION",
                        format!("Backup integrity validation failed: {}", err.message()),
                    )
                    .with_cause(err)
                })?;
        }

        let mut backup_created = None;
        if options.create_backup_before_restore {
            let mut snapshot_options = self.defaults.clone();
            snapshot_options.custom_file_name = Some(format!(
                "{SAFETY_BACKUP_PREFIX}-{}",
                Utc::now().timestamp()
            ));
            // a retention sweep must not race the file being restored
            snapshot_options.auto_cleanup = false;
            match self.create_backup_inner(snapshot_options).await {
                Ok(result) => backup_created = result.file_path,
                Err(err) => {
                    // availability over safety: the restore still proceeds
                    tracing::warn!(
                        target: "parlance",
                        error = %err,
                        "pre_restore_backup_failed"
                    );
                }
            }
        }

        // nothing may write through a stale handle while files are swapped
        self.connection.close_and_clear().await;

        let plan = writer::RestorePlan {
            overwrite_existing: options.overwrite_existing,
            restore_wal: options.restore_wal,
            restore_shm: options.restore_shm,
        };
        let backup = backup_path.to_path_buf();
        let live = self.db_path.clone();
        task::spawn_blocking(move || writer::restore_database_file(&backup, &live, &plan))
            .await
            .map_err(|err| {
                AppError::new("RESTORE/TASK", "Restore task panicked")
                    .with_context("error", err.to_string())
            })??;

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        tracing::info!(
            target: "parlance",
            path = %self.db_path.display(),
            "restore_completed"
        );
        Ok(RestoreResult::completed(
            self.db_path.display().to_string(),
            backup_created,
            timestamp,
        ))
    }

    /// Enumerate existing backups, newest first. Best-effort: a missing
    /// directory or unreadable entry yields fewer results, not an error.
    pub async fn list_backups(&self) -> Vec<BackupMetadata> {
        let dir = match self.backup_dir(&self.defaults) {
            Ok(dir) => dir,
            Err(err) => {
                tracing::warn!(target: "parlance", error = %err, "list_backups_no_dir");
                return Vec::new();
            }
        };
        task::spawn_blocking(move || catalog::list_backups_sync(&dir))
            .await
            .unwrap_or_else(|err| {
                tracing::error!(target: "parlance", error = %err, "list_backups_panicked");
                Vec::new()
            })
    }

    /// Delete a single backup by file name. All failure modes, including
    /// a missing target, collapse to `false`.
    pub async fn delete_backup(&self, id: &str) -> bool {
        let _guard = self.op_lock.lock().await;
        // ids are plain file names; reject anything path-like
        if id.is_empty() || id.contains(['/', '\\']) {
            tracing::warn!(target: "parlance", id, "delete_backup_invalid_id");
            return false;
        }
        let dir = match self.backup_dir(&self.defaults) {
            Ok(dir) => dir,
            Err(_) => return false,
        };
        let path = dir.join(id);
        task::spawn_blocking(move || match catalog::delete_backup_files(&path) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    target: "parlance",
                    error = %err,
                    path = %path.display(),
                    "delete_backup_failed"
                );
                false
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Apply the retention policy now, returning the paths deleted.
    /// With `max_backups` = 0 every existing backup is removed.
    pub async fn cleanup_old_backups(&self) -> Vec<String> {
        let _guard = self.op_lock.lock().await;
        let dir = match self.backup_dir(&self.defaults) {
            Ok(dir) => dir,
            Err(err) => {
                tracing::warn!(target: "parlance", error = %err, "cleanup_no_dir");
                return Vec::new();
            }
        };
        let max = self.defaults.max_backups;
        task::spawn_blocking(move || catalog::apply_retention_sync(&dir, max))
            .await
            .unwrap_or_else(|err| {
                tracing::error!(target: "parlance", error = %err, "cleanup_panicked");
                Vec::new()
            })
    }

    /// Validate a backup file; every failure mode collapses to `false`.
    pub async fn validate_backup(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref().to_path_buf();
        task::spawn_blocking(move || match validate::validate_file_sync(&path) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    target: "parlance",
                    error = %err,
                    path = %path.display(),
                    "backup_validation_failed"
                );
                false
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Aggregate counts and sizes, derived purely from `list_backups`.
    pub async fn get_backup_stats(&self) -> BackupStats {
        let backups = self.list_backups().await;
        BackupStats {
            total_backups: backups.len(),
            total_size: backups.iter().map(|b| b.size).sum(),
            newest_backup: backups.first().map(|b| b.timestamp.clone()),
            oldest_backup: backups.last().map(|b| b.timestamp.clone()),
        }
    }
}

struct WrittenBackup {
    file_path: String,
    size: u64,
    created_at: String,
}

fn write_backup_sync(
    db_path: &Path,
    dir: &Path,
    prefix: &str,
    include_wal: bool,
    include_shm: bool,
    db_version: i64,
) -> AppResult<WrittenBackup> {
    paths::ensure_dir(dir)?;
    ensure_free_space(db_path, dir)?;

    let created = Utc::now();
    let created_at = created.to_rfc3339_opts(SecondsFormat::Millis, true);
    let backup_path = catalog::allocate_backup_path(dir, prefix, &created)?;

    let result = (|| -> AppResult<WrittenBackup> {
        writer::copy_database_file(db_path, &backup_path)?;
        let wal_included =
            include_wal && writer::copy_companion(db_path, &backup_path, writer::WAL_SUFFIX)?;
        let shm_included =
            include_shm && writer::copy_companion(db_path, &backup_path, writer::SHM_SUFFIX)?;

        let sha256 = manifest::file_sha256(&backup_path)
            .map_err(|err| AppError::from(err).with_context("operation", "hash_backup"))?;
        let size = fs::metadata(&backup_path).map(|meta| meta.len()).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "stat_backup")
                .with_context("path", backup_path.display().to_string())
        })?;

        let manifest = BackupManifest {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            db_version,
            db_size_bytes: size,
            created_at: created_at.clone(),
            sha256,
            wal_included,
            shm_included,
        };
        manifest::write_manifest(&manifest::manifest_path_for(&backup_path), &manifest)?;

        Ok(WrittenBackup {
            file_path: backup_path.display().to_string(),
            size,
            created_at: created_at.clone(),
        })
    })();

    if result.is_err() {
        writer::remove_backup_set(&backup_path);
    }
    result
}

fn ensure_free_space(db_path: &Path, backup_dir: &Path) -> AppResult<()> {
    let db_size = fs::metadata(db_path).map(|meta| meta.len()).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "db_metadata")
            .with_context("path", db_path.display().to_string())
    })?;
    let journal_bytes: u64 = [writer::WAL_SUFFIX, writer::SHM_SUFFIX]
        .iter()
        .map(|suffix| {
            fs::metadata(paths::sidecar_path(db_path, suffix))
                .map(|meta| meta.len())
                .unwrap_or(0)
        })
        .sum();

    let required = required_free_bytes(db_size.saturating_add(journal_bytes));
    let available = free_disk_space(backup_dir)?;
    if available < required {
        return Err(AppError::new(
            "BACKUP/LOW_DISK",
            format!("Not enough disk space for a backup (need ~{required} bytes)"),
        )
        .with_context("available_bytes", available.to_string())
        .with_context("required_bytes", required.to_string()));
    }
    Ok(())
}

fn required_free_bytes(db_size: u64) -> u64 {
    if db_size == 0 {
        return 100_000_000;
    }
    ((db_size as f64) * REQUIRED_FREE_MULTIPLIER).ceil() as u64
}

fn free_disk_space(path: &Path) -> AppResult<u64> {
    if let Ok(fake) = env::var(FAKE_FREE_BYTES_ENV) {
        if let Ok(value) = fake.parse::<u64>() {
            return Ok(value);
        }
    }

    let mut owned: Option<PathBuf> = None;
    let target = if path.exists() {
        path
    } else if let Some(parent) = path.parent() {
        owned = Some(parent.to_path_buf());
        owned.as_ref().unwrap()
    } else {
        owned = Some(env::current_dir().unwrap_or_else(|_| PathBuf::from("/")));
        owned.as_ref().unwrap()
    };

    available_space(target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", target.display().to_string())
    })
}
