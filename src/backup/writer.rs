use std::fs;
use std::io;
use std::path::Path;

use crate::db::{sync_dir, sync_file};
use crate::paths::sidecar_path;
use crate::{AppError, AppResult};

use super::manifest::MANIFEST_SUFFIX;

pub const PARTIAL_SUFFIX: &str = ".partial";
pub const WAL_SUFFIX: &str = "-wal";
pub const SHM_SUFFIX: &str = "-shm";

/// Copy `src` to `dest` through a `.partial` temp name so a crashed copy
/// never leaves a plausible-looking database at the destination.
pub fn copy_database_file(src: &Path, dest: &Path) -> AppResult<u64> {
    let partial = sidecar_path(dest, PARTIAL_SUFFIX);
    let copied = fs::copy(src, &partial).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_database")
            .with_context("from", src.display().to_string())
            .with_context("to", partial.display().to_string())
    })?;
    sync_file(&partial).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "sync_copied_database")
            .with_context("path", partial.display().to_string())
    })?;
    fs::rename(&partial, dest).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "finalize_copy")
            .with_context("from", partial.display().to_string())
            .with_context("to", dest.display().to_string())
    })?;
    if let Some(parent) = dest.parent() {
        sync_dir(parent).ok();
    }
    Ok(copied)
}

/// Copy an optional `-wal`/`-shm` companion next to `dest_base`.
/// A missing companion is normal (nothing unflushed) and not an error.
pub fn copy_companion(src_base: &Path, dest_base: &Path, suffix: &str) -> AppResult<bool> {
    let src = sidecar_path(src_base, suffix);
    if !src.exists() {
        return Ok(false);
    }
    let dest = sidecar_path(dest_base, suffix);
    fs::copy(&src, &dest).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_companion")
            .with_context("from", src.display().to_string())
            .with_context("to", dest.display().to_string())
    })?;
    sync_file(&dest).ok();
    Ok(true)
}

pub fn remove_if_present(path: &Path) -> AppResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::from(err)
            .with_context("operation", "remove_file")
            .with_context("path", path.display().to_string())),
    }
}

/// Best-effort removal of a backup file set after a failed write.
pub fn remove_backup_set(path: &Path) {
    for candidate in [
        sidecar_path(path, PARTIAL_SUFFIX),
        path.to_path_buf(),
        sidecar_path(path, WAL_SUFFIX),
        sidecar_path(path, SHM_SUFFIX),
        sidecar_path(path, MANIFEST_SUFFIX),
    ] {
        let _ = fs::remove_file(candidate);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestorePlan {
    pub overwrite_existing: bool,
    pub restore_wal: bool,
    pub restore_shm: bool,
}

/// Replace the live database file set with the backup's.
///
/// The caller must have closed the live connection first. When the main
/// file is swapped, stale live `-wal`/`-shm` sidecars are removed before
/// any companion copy: a replaced main file next to an old WAL corrupts
/// the database on next open. Returns whether the main file was swapped.
pub fn restore_database_file(backup: &Path, live: &Path, plan: &RestorePlan) -> AppResult<bool> {
    if !backup.exists() {
        return Err(AppError::new(
            "RESTORE/MISSING_SOURCE",
            "Backup file does not exist",
        )
        .with_context("path", backup.display().to_string()));
    }

    let swapped = if live.exists() && !plan.overwrite_existing {
        tracing::info!(
            target: "parlance",
            path = %live.display(),
            "restore_swap_skipped_existing"
        );
        false
    } else {
        copy_database_file(backup, live)?;
        remove_if_present(&sidecar_path(live, WAL_SUFFIX))?;
        remove_if_present(&sidecar_path(live, SHM_SUFFIX))?;
        true
    };

    if plan.restore_wal {
        copy_companion(backup, live, WAL_SUFFIX)?;
    }
    if plan.restore_shm {
        copy_companion(backup, live, SHM_SUFFIX)?;
    }

    Ok(swapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copy_leaves_no_partial_behind() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src.sqlite");
        let dest = tmp.path().join("dest.sqlite");
        fs::write(&src, b"payload").unwrap();

        let copied = copy_database_file(&src, &dest).unwrap();
        assert_eq!(copied, 7);
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(!sidecar_path(&dest, PARTIAL_SUFFIX).exists());
    }

    #[test]
    fn missing_companion_is_not_an_error() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src.sqlite");
        let dest = tmp.path().join("dest.sqlite");
        fs::write(&src, b"payload").unwrap();

        assert!(!copy_companion(&src, &dest, WAL_SUFFIX).unwrap());

        fs::write(sidecar_path(&src, WAL_SUFFIX), b"wal").unwrap();
        assert!(copy_companion(&src, &dest, WAL_SUFFIX).unwrap());
        assert_eq!(fs::read(sidecar_path(&dest, WAL_SUFFIX)).unwrap(), b"wal");
    }

    #[test]
    fn restore_skips_existing_live_file_without_overwrite() {
        let tmp = tempdir().unwrap();
        let backup = tmp.path().join("backup.sqlite");
        let live = tmp.path().join("database.sqlite");
        fs::write(&backup, b"snapshot").unwrap();
        fs::write(&live, b"current").unwrap();

        let plan = RestorePlan {
            overwrite_existing: false,
            restore_wal: false,
            restore_shm: false,
        };
        let swapped = restore_database_file(&backup, &live, &plan).unwrap();
        assert!(!swapped);
        assert_eq!(fs::read(&live).unwrap(), b"current");
    }

    #[test]
    fn restore_swap_removes_stale_sidecars() {
        let tmp = tempdir().unwrap();
        let backup = tmp.path().join("backup.sqlite");
        let live = tmp.path().join("database.sqlite");
        fs::write(&backup, b"snapshot").unwrap();
        fs::write(&live, b"current").unwrap();
        fs::write(sidecar_path(&live, WAL_SUFFIX), b"stale-wal").unwrap();
        fs::write(sidecar_path(&live, SHM_SUFFIX), b"stale-shm").unwrap();

        let plan = RestorePlan {
            overwrite_existing: true,
            restore_wal: false,
            restore_shm: false,
        };
        let swapped = restore_database_file(&backup, &live, &plan).unwrap();
        assert!(swapped);
        assert_eq!(fs::read(&live).unwrap(), b"snapshot");
        assert!(!sidecar_path(&live, WAL_SUFFIX).exists());
        assert!(!sidecar_path(&live, SHM_SUFFIX).exists());
    }

    #[test]
    fn restore_copies_requested_companions() {
        let tmp = tempdir().unwrap();
        let backup = tmp.path().join("backup.sqlite");
        let live = tmp.path().join("database.sqlite");
        fs::write(&backup, b"snapshot").unwrap();
        fs::write(sidecar_path(&backup, WAL_SUFFIX), b"backup-wal").unwrap();
        fs::write(&live, b"current").unwrap();
        fs::write(sidecar_path(&live, WAL_SUFFIX), b"stale-wal").unwrap();

        let plan = RestorePlan {
            overwrite_existing: true,
            restore_wal: true,
            restore_shm: false,
        };
        restore_database_file(&backup, &live, &plan).unwrap();
        assert_eq!(
            fs::read(sidecar_path(&live, WAL_SUFFIX)).unwrap(),
            b"backup-wal"
        );
    }
}
