use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{AppError, AppResult};

pub const DB_FILE_NAME: &str = "database.sqlite";
pub const BACKUP_DIR_NAME: &str = "backups";
const APP_DIR_NAME: &str = "parlance";
const FAKE_APPDATA_ENV: &str = "PARLANCE_FAKE_APPDATA";

/// Application data directory: platform data dir plus the app folder.
///
/// `PARLANCE_FAKE_APPDATA` overrides the location wholesale (used by the
/// CLI tests to point the whole file set at a temp directory).
pub fn app_data_dir() -> AppResult<PathBuf> {
    if let Ok(fake) = env::var(FAKE_APPDATA_ENV) {
        return Ok(PathBuf::from(fake));
    }

    let base = dirs::data_dir()
        .or_else(|| env::current_dir().ok())
        .ok_or_else(|| {
            AppError::new(
                "PATHS/NO_DATA_DIR",
                "failed to resolve application data directory",
            )
        })?;
    Ok(base.join(APP_DIR_NAME))
}

/// Path of the live database file.
pub fn live_db_path() -> AppResult<PathBuf> {
    Ok(app_data_dir()?.join(DB_FILE_NAME))
}

/// Default backup directory: a `backups` folder next to the live database.
pub fn default_backup_dir(db_path: &Path) -> AppResult<PathBuf> {
    let parent = db_path.parent().ok_or_else(|| {
        AppError::new(
            "PATHS/NO_PARENT",
            "Database path does not have a parent directory",
        )
        .with_context("path", db_path.display().to_string())
    })?;
    Ok(parent.join(BACKUP_DIR_NAME))
}

/// Idempotent directory creation; an existing directory is success.
pub fn ensure_dir(path: &Path) -> AppResult<()> {
    fs::create_dir_all(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "ensure_dir")
            .with_context("path", path.display().to_string())
    })
}

/// Append a suffix to a path without touching its extension, e.g.
/// `database.sqlite` + `-wal` → `database.sqlite-wal`.
pub fn sidecar_path(base: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(base.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}
