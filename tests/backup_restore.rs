use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use parlance::backup::{BackupManager, BackupOptions, RestoreOptions};
use parlance::{db, schema, ConnectionHandle};
use tempfile::tempdir;

async fn seeded_manager(root: &Path) -> Result<BackupManager> {
    seeded_manager_with(root, BackupOptions::default()).await
}

async fn seeded_manager_with(root: &Path, defaults: BackupOptions) -> Result<BackupManager> {
    let db_path = root.join("database.sqlite");
    let pool = db::open_pool(&db_path).await?;
    schema::apply(&pool).await?;
    sqlx::query(
        "INSERT INTO conversations(id, title, created_at, updated_at)
         VALUES (1, 'general', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "INSERT INTO messages(conversation_id, sender, body, sent_at)
         VALUES (1, 'ada', 'hello', '2026-01-01T00:00:01Z');",
    )
    .execute(&pool)
    .await?;
    Ok(BackupManager::new(
        ConnectionHandle::new(pool),
        db_path,
        defaults,
    ))
}

#[tokio::test]
async fn create_backup_then_validate() -> Result<()> {
    let tmp = tempdir()?;
    let manager = seeded_manager(tmp.path()).await?;

    let result = manager.create_backup(None).await;
    assert!(result.success, "backup failed: {:?}", result.error);
    let path = result.file_path.expect("backup path");
    assert!(result.size.unwrap_or(0) > 0);

    assert!(manager.validate_backup(&path).await);
    assert!(
        PathBuf::from(format!("{path}.manifest.json")).exists(),
        "manifest sidecar missing"
    );
    Ok(())
}

#[tokio::test]
async fn create_backup_without_connection_reports_not_initialized() -> Result<()> {
    let tmp = tempdir()?;
    let db_path = tmp.path().join("database.sqlite");
    let manager = BackupManager::new(
        ConnectionHandle::empty(),
        &db_path,
        BackupOptions::default(),
    );

    let result = manager.create_backup(None).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Database not initialized"));
    assert!(
        !tmp.path().join("backups").exists(),
        "no file I/O expected before the connection check"
    );
    Ok(())
}

#[tokio::test]
async fn backup_includes_wal_companion_when_present() -> Result<()> {
    let tmp = tempdir()?;
    let manager = seeded_manager(tmp.path()).await?;

    // the pool is open in WAL mode and has written, so a -wal file exists
    assert!(tmp.path().join("database.sqlite-wal").exists());

    let result = manager.create_backup(None).await;
    assert!(result.success, "backup failed: {:?}", result.error);
    let backup = PathBuf::from(result.file_path.unwrap());
    assert!(PathBuf::from(format!("{}-wal", backup.display())).exists());

    let listed = manager.list_backups().await;
    let entry = listed
        .iter()
        .find(|b| b.file_path == backup.display().to_string())
        .expect("created backup listed");
    assert!(entry.wal_included);
    assert!(!entry.shm_included, "shm is excluded by default");
    assert!(entry.checksum.is_some(), "manifest checksum recorded");
    Ok(())
}

#[tokio::test]
async fn restore_from_corrupt_backup_leaves_live_database_alone() -> Result<()> {
    let tmp = tempdir()?;
    let manager = seeded_manager(tmp.path()).await?;

    let bogus = tmp.path().join("bogus.sqlite");
    fs::write(&bogus, b"this is not a database")?;
    let before = fs::read(manager.db_path())?;

    let result = manager.restore_from_backup(&bogus, None).await;
    assert!(!result.success);
    let message = result.error.expect("error message");
    assert!(
        message.contains("integrity validation failed"),
        "unexpected error: {message}"
    );

    assert_eq!(before, fs::read(manager.db_path())?);
    assert!(
        manager.connection().get().is_some(),
        "validation failure must not disconnect the live pool"
    );
    Ok(())
}

#[tokio::test]
async fn restore_overwrites_live_database_and_preserves_integrity() -> Result<()> {
    let tmp = tempdir()?;
    let manager = seeded_manager(tmp.path()).await?;

    let created = manager.create_backup(None).await;
    assert!(created.success, "backup failed: {:?}", created.error);
    let backup_path = created.file_path.unwrap();

    // mutate the live database after the snapshot
    let pool = manager.connection().get().expect("live pool");
    sqlx::query(
        "INSERT INTO messages(conversation_id, sender, body, sent_at)
         VALUES (1, 'bob', 'later', '2026-01-02T00:00:00Z');",
    )
    .execute(&pool)
    .await?;
    drop(pool);

    let options = RestoreOptions {
        overwrite_existing: true,
        ..RestoreOptions::default()
    };
    let result = manager.restore_from_backup(&backup_path, Some(options)).await;
    assert!(result.success, "restore failed: {:?}", result.error);
    assert_eq!(
        result.restored_path.as_deref(),
        manager.db_path().to_str(),
    );

    let safety = result.backup_created.expect("safety snapshot recorded");
    let safety_path = PathBuf::from(&safety);
    assert!(safety_path.exists());
    assert!(safety_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap()
        .starts_with("pre-restore-backup-"));

    // the slot is cleared; reopening is the caller's responsibility
    assert!(manager.connection().get().is_none());

    // restored live file has the same integrity outcome as the backup
    assert!(manager.validate_backup(manager.db_path()).await);
    assert!(manager.validate_backup(&backup_path).await);

    // snapshot state is back: the later message is gone
    let pool = db::open_pool(manager.db_path()).await?;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages;")
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 1);
    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn restore_without_overwrite_skips_existing_live_file() -> Result<()> {
    let tmp = tempdir()?;
    let manager = seeded_manager(tmp.path()).await?;

    let created = manager.create_backup(None).await;
    assert!(created.success);
    let backup_path = created.file_path.unwrap();

    let pool = manager.connection().get().expect("live pool");
    sqlx::query(
        "INSERT INTO messages(conversation_id, sender, body, sent_at)
         VALUES (1, 'bob', 'kept', '2026-01-02T00:00:00Z');",
    )
    .execute(&pool)
    .await?;
    drop(pool);

    // overwrite_existing defaults to false: the swap is skipped
    let result = manager.restore_from_backup(&backup_path, None).await;
    assert!(result.success, "restore failed: {:?}", result.error);

    let pool = db::open_pool(manager.db_path()).await?;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages;")
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 2, "live data must be kept when the swap is skipped");
    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn cleanup_keeps_newest_max_backups_and_is_idempotent() -> Result<()> {
    let tmp = tempdir()?;
    let defaults = BackupOptions {
        max_backups: 2,
        auto_cleanup: false,
        ..BackupOptions::default()
    };
    let manager = seeded_manager_with(tmp.path(), defaults).await?;

    for _ in 0..4 {
        let result = manager.create_backup(None).await;
        assert!(result.success, "backup failed: {:?}", result.error);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let all = manager.list_backups().await;
    assert_eq!(all.len(), 4);
    let newest: Vec<String> = all.iter().take(2).map(|b| b.id.clone()).collect();

    let deleted = manager.cleanup_old_backups().await;
    assert_eq!(deleted.len(), 2);

    let remaining = manager.list_backups().await;
    assert_eq!(remaining.len(), 2);
    assert_eq!(
        remaining.iter().map(|b| b.id.clone()).collect::<Vec<_>>(),
        newest,
        "the survivors are the most recent backups"
    );

    // second sweep with no new backups deletes nothing
    assert!(manager.cleanup_old_backups().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn cleanup_with_zero_cap_deletes_every_backup() -> Result<()> {
    let tmp = tempdir()?;
    let defaults = BackupOptions {
        max_backups: 0,
        ..BackupOptions::default()
    };
    let manager = seeded_manager_with(tmp.path(), defaults).await?;

    for _ in 0..2 {
        let result = manager.create_backup(None).await;
        assert!(result.success, "backup failed: {:?}", result.error);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(manager.list_backups().await.len(), 2);

    let deleted = manager.cleanup_old_backups().await;
    assert_eq!(deleted.len(), 2);
    assert!(manager.list_backups().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn list_backups_orders_newest_first() -> Result<()> {
    let tmp = tempdir()?;
    let defaults = BackupOptions {
        auto_cleanup: false,
        ..BackupOptions::default()
    };
    let manager = seeded_manager_with(tmp.path(), defaults).await?;

    let mut created_order = Vec::new();
    for _ in 0..3 {
        let result = manager.create_backup(None).await;
        assert!(result.success);
        created_order.push(result.file_path.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let listed = manager.list_backups().await;
    assert_eq!(listed.len(), 3);
    let listed_paths: Vec<&str> = listed.iter().map(|b| b.file_path.as_str()).collect();
    let expected: Vec<&str> = created_order.iter().rev().map(String::as_str).collect();
    assert_eq!(listed_paths, expected);

    let stats = manager.get_backup_stats().await;
    assert_eq!(stats.total_backups, 3);
    assert_eq!(stats.total_size, listed.iter().map(|b| b.size).sum::<u64>());
    assert_eq!(stats.newest_backup.as_deref(), Some(listed[0].timestamp.as_str()));
    assert_eq!(stats.oldest_backup.as_deref(), Some(listed[2].timestamp.as_str()));
    Ok(())
}

#[tokio::test]
async fn delete_backup_handles_missing_and_existing_targets() -> Result<()> {
    let tmp = tempdir()?;
    let manager = seeded_manager(tmp.path()).await?;

    assert!(!manager.delete_backup("nonexistent.sqlite").await);

    let result = manager.create_backup(None).await;
    assert!(result.success);
    let path = PathBuf::from(result.file_path.unwrap());
    let id = path.file_name().unwrap().to_str().unwrap().to_string();

    assert!(manager.delete_backup(&id).await);
    assert!(!path.exists());
    assert!(
        !PathBuf::from(format!("{}.manifest.json", path.display())).exists(),
        "manifest removed with the backup"
    );
    // deleting the same backup again fails quietly
    assert!(!manager.delete_backup(&id).await);
    Ok(())
}

#[tokio::test]
async fn custom_named_backups_are_listed_and_restorable() -> Result<()> {
    let tmp = tempdir()?;
    let manager = seeded_manager(tmp.path()).await?;

    let options = BackupOptions {
        custom_file_name: Some("weekly".into()),
        ..BackupOptions::default()
    };
    let result = manager.create_backup(Some(options)).await;
    assert!(result.success, "backup failed: {:?}", result.error);
    let path = result.file_path.unwrap();
    assert!(path.contains("weekly-"));

    let listed = manager.list_backups().await;
    assert!(listed.iter().any(|b| b.file_path == path));
    assert!(manager.validate_backup(&path).await);
    Ok(())
}

#[tokio::test]
async fn list_tolerates_foreign_files_via_mtime_fallback() -> Result<()> {
    let tmp = tempdir()?;
    let manager = seeded_manager(tmp.path()).await?;

    let backups_dir = tmp.path().join("backups");
    fs::create_dir_all(&backups_dir)?;
    fs::write(backups_dir.join("orphan.sqlite"), b"dropped in by hand")?;

    let listed = manager.list_backups().await;
    assert_eq!(listed.len(), 1);
    let entry = &listed[0];
    assert_eq!(entry.id, "orphan.sqlite");
    assert!(entry.checksum.is_none(), "no manifest, no checksum");
    assert!(entry.app_version.is_none());
    assert!(!entry.timestamp.is_empty(), "mtime fallback timestamp");
    Ok(())
}
