use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::paths::sidecar_path;
use crate::{AppError, AppResult};

use super::manifest::{self, MANIFEST_SUFFIX};
use super::writer::{self, SHM_SUFFIX, WAL_SUFFIX};
use super::BackupMetadata;

pub const DEFAULT_BACKUP_PREFIX: &str = "database-backup";
pub const BACKUP_EXTENSION: &str = "sqlite";

/// Timestamp slug embedded in generated file names, e.g.
/// `database-backup-2026-08-07T12-34-56-789Z.sqlite`.
static FILE_STAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}-\d{3}Z)(?:-\d{2})?\.sqlite$")
        .expect("valid backup stamp pattern")
});
const FILE_STAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

/// Encode a timestamp so generated names sort lexicographically in
/// creation order: RFC-3339, with ':' and '.' flattened to '-'.
pub fn timestamp_slug(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Allocate a non-colliding backup path under `dir`.
pub fn allocate_backup_path(
    dir: &Path,
    prefix: &str,
    at: &DateTime<Utc>,
) -> AppResult<PathBuf> {
    let base = format!("{prefix}-{}", timestamp_slug(at));
    for suffix in 0..100 {
        let name = if suffix == 0 {
            format!("{base}.{BACKUP_EXTENSION}")
        } else {
            format!("{base}-{suffix:02}.{BACKUP_EXTENSION}")
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(
        AppError::new("BACKUP/NAME_COLLISION", "Unable to allocate backup file name")
            .with_context("dir", dir.display().to_string()),
    )
}

/// Recover the creation time embedded in a generated file name.
/// Custom names without the stamp return `None` (callers fall back to
/// the manifest or the file's mtime).
pub fn parse_file_stamp(file_name: &str) -> Option<DateTime<Utc>> {
    let captures = FILE_STAMP.captures(file_name)?;
    let stamp = captures.get(1)?.as_str();
    NaiveDateTime::parse_from_str(stamp, FILE_STAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Scan the backup directory and materialize metadata for every backup
/// file, newest first. A missing directory is an empty catalog; files
/// that cannot be described are logged and skipped.
pub fn list_backups_sync(dir: &Path) -> Vec<BackupMetadata> {
    if !dir.exists() {
        return Vec::new();
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(
                target: "parlance",
                error = %err,
                path = %dir.display(),
                "read_backup_dir_failed"
            );
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(target: "parlance", error = %err, "skip_invalid_backup_entry");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some(BACKUP_EXTENSION) {
            continue;
        }
        match load_metadata(&path) {
            Ok(meta) => out.push(meta),
            Err(err) => {
                tracing::warn!(
                    target: "parlance",
                    error = %err,
                    path = %path.display(),
                    "skip_backup_invalid"
                );
            }
        }
    }

    // RFC-3339 UTC strings compare chronologically; id breaks ties.
    out.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.id.cmp(&a.id))
    });
    out
}

fn load_metadata(path: &Path) -> AppResult<BackupMetadata> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            AppError::new("BACKUP/BAD_NAME", "Backup file name is not valid UTF-8")
                .with_context("path", path.display().to_string())
        })?
        .to_string();

    let meta = fs::metadata(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "stat_backup")
            .with_context("path", path.display().to_string())
    })?;

    let manifest = manifest::read_manifest(&manifest::manifest_path_for(path)).ok();
    let timestamp = manifest
        .as_ref()
        .map(|m| m.created_at.clone())
        .or_else(|| {
            parse_file_stamp(&file_name)
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
        })
        .unwrap_or_else(|| modified_stamp(&meta));

    Ok(BackupMetadata {
        id: file_name,
        timestamp,
        file_path: path.display().to_string(),
        size: meta.len(),
        compressed: false,
        db_version: manifest.as_ref().map(|m| m.db_version),
        app_version: manifest.as_ref().map(|m| m.app_version.clone()),
        checksum: manifest.as_ref().map(|m| m.sha256.clone()),
        wal_included: sidecar_path(path, WAL_SUFFIX).exists(),
        shm_included: sidecar_path(path, SHM_SUFFIX).exists(),
    })
}

fn modified_stamp(meta: &fs::Metadata) -> String {
    let modified = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::SystemTime::UNIX_EPOCH));
    modified.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Keep the newest `max_backups`; delete the rest. Best-effort by
/// design: a failed deletion is logged and skipped, so partial
/// completion is a valid terminal state. Returns the main-file paths
/// actually deleted.
pub fn apply_retention_sync(dir: &Path, max_backups: usize) -> Vec<String> {
    let backups = list_backups_sync(dir);
    if backups.len() <= max_backups {
        return Vec::new();
    }

    let mut deleted = Vec::new();
    for stale in &backups[max_backups..] {
        let path = PathBuf::from(&stale.file_path);
        match delete_backup_files(&path) {
            Ok(()) => deleted.push(stale.file_path.clone()),
            Err(err) => {
                tracing::warn!(
                    target: "parlance",
                    error = %err,
                    path = %path.display(),
                    "failed_to_remove_old_backup"
                );
            }
        }
    }
    deleted
}

/// Remove a backup's main file plus tolerant removal of its companions
/// and manifest sidecar. The main file must exist.
pub fn delete_backup_files(path: &Path) -> AppResult<()> {
    fs::remove_file(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "remove_backup")
            .with_context("path", path.display().to_string())
    })?;
    for suffix in [WAL_SUFFIX, SHM_SUFFIX, MANIFEST_SUFFIX] {
        writer::remove_if_present(&sidecar_path(path, suffix))?;
    }
    Ok(())
}
