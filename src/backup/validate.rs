use std::collections::HashSet;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use crate::schema::CORE_TABLES;
use crate::{AppError, AppResult};

use super::manifest;

/// Validate a candidate database file without touching the live pool.
///
/// Opens an independent, read-only, throwaway connection, so validation
/// works on files nobody has open and never interferes with live
/// traffic. Three gates, in cost order: manifest checksum (when a
/// sidecar exists), structural checks, core-table presence.
pub fn validate_file_sync(path: &Path) -> AppResult<()> {
    if !path.exists() {
        return Err(
            AppError::new("BACKUP/VALIDATE_MISSING", "Backup file does not exist")
                .with_context("path", path.display().to_string()),
        );
    }

    checksum_gate(path)?;

    let conn =
        Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_validation_db")
                .with_context("path", path.display().to_string())
        })?;

    // run the checks first so the scratch connection is closed on every
    // path; a leaked handle blocks later operations on the same file
    let outcome = run_checks(&conn);
    let close_result = conn.close();
    outcome?;
    close_result
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_validation_db"))?;
    Ok(())
}

fn checksum_gate(path: &Path) -> AppResult<()> {
    let manifest_path = manifest::manifest_path_for(path);
    if !manifest_path.exists() {
        return Ok(());
    }
    let manifest = manifest::read_manifest(&manifest_path)
        .map_err(|err| AppError::from(err).with_context("operation", "read_manifest"))?;
    let actual = manifest::file_sha256(path)
        .map_err(|err| AppError::from(err).with_context("operation", "hash_candidate"))?;
    if actual != manifest.sha256 {
        return Err(AppError::new(
            "BACKUP/CHECKSUM_MISMATCH",
            "Backup checksum does not match its manifest",
        )
        .with_context("expected", manifest.sha256)
        .with_context("actual", actual));
    }
    Ok(())
}

fn run_checks(conn: &Connection) -> AppResult<()> {
    let quick: String = conn
        .query_row("PRAGMA quick_check;", [], |row| row.get(0))
        .map_err(|err| AppError::from(err).with_context("operation", "quick_check"))?;
    if !quick.eq_ignore_ascii_case("ok") {
        return Err(AppError::new(
            "BACKUP/QUICK_CHECK_FAILED",
            format!("quick_check reported: {quick}"),
        ));
    }

    // integrity_check emits one row per problem; a healthy file reports
    // a single "ok"
    let mut stmt = conn
        .prepare("PRAGMA integrity_check;")
        .map_err(|err| AppError::from(err).with_context("operation", "prepare_integrity_check"))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|err| AppError::from(err).with_context("operation", "integrity_check"))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(|err| AppError::from(err).with_context("operation", "integrity_check_rows"))?;
    if rows.len() != 1 || !rows[0].eq_ignore_ascii_case("ok") {
        return Err(AppError::new(
            "BACKUP/INTEGRITY_FAILED",
            format!("integrity_check reported: {}", rows.join("; ")),
        ));
    }
    drop(stmt);

    // schema sanity: refuse snapshots from an incompatible schema
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
        .map_err(|err| AppError::from(err).with_context("operation", "prepare_table_scan"))?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|err| AppError::from(err).with_context("operation", "table_scan"))?
        .collect::<Result<HashSet<String>, _>>()
        .map_err(|err| AppError::from(err).with_context("operation", "table_scan_rows"))?;
    let missing: Vec<&str> = CORE_TABLES
        .iter()
        .copied()
        .filter(|table| !tables.contains(*table))
        .collect();
    if !missing.is_empty() {
        return Err(AppError::new(
            "BACKUP/SCHEMA_MISMATCH",
            format!("missing core table(s): {}", missing.join(", ")),
        ));
    }

    Ok(())
}
