use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use parlance::backup::{BackupManager, BackupOptions, RestoreOptions};
use parlance::{db, paths, schema, ConnectionHandle};

#[derive(Debug, Parser)]
#[command(name = "parlance", about = "Parlance desktop chat backend", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Database maintenance and inspection commands.
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Create a consistent snapshot of the live database.
    Backup {
        /// Emit the machine-readable result instead of the text summary.
        #[arg(long)]
        json: bool,
        /// Use a custom file-name prefix instead of `database-backup`.
        #[arg(long)]
        name: Option<String>,
    },
    /// Restore the live database from a backup file.
    Restore {
        path: PathBuf,
        /// Replace the live database file even when one exists.
        #[arg(long)]
        overwrite: bool,
        /// Skip the integrity validation of the backup file.
        #[arg(long)]
        no_validate: bool,
        /// Skip the pre-restore safety snapshot.
        #[arg(long)]
        no_safety_backup: bool,
        /// Also restore the backup's `-wal` companion.
        #[arg(long)]
        wal: bool,
        /// Also restore the backup's `-shm` companion.
        #[arg(long)]
        shm: bool,
        #[arg(long)]
        json: bool,
    },
    /// List the backups currently on disk, newest first.
    Backups {
        #[arg(long)]
        json: bool,
    },
    /// Delete a single backup by file name.
    Delete { id: String },
    /// Apply the retention policy and report what was removed.
    Cleanup {
        #[arg(long)]
        json: bool,
    },
    /// Validate a backup file without touching the live database.
    Verify { path: PathBuf },
    /// Aggregate backup statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    parlance::init_logging();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn run(command: Commands) -> Result<i32> {
    let runtime = tokio::runtime::Runtime::new().context("start async runtime")?;
    runtime.block_on(async {
        match command {
            Commands::Db(db_command) => handle_db_command(db_command).await,
        }
    })
}

async fn open_manager() -> Result<BackupManager> {
    let db_path = paths::live_db_path().context("determine database path")?;
    let pool = db::open_pool(&db_path).await.context("open live database")?;
    schema::apply(&pool).await.context("apply schema")?;
    Ok(BackupManager::new(
        ConnectionHandle::new(pool),
        db_path,
        BackupOptions::from_env(),
    ))
}

async fn handle_db_command(command: DbCommand) -> Result<i32> {
    let manager = open_manager().await?;
    let code = match command {
        DbCommand::Backup { json, name } => {
            let options = name.map(|custom| BackupOptions {
                custom_file_name: Some(custom),
                ..BackupOptions::from_env()
            });
            let result = manager.create_backup(options).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if result.success {
                println!(
                    "Backup stored at {} ({} bytes)",
                    result.file_path.as_deref().unwrap_or("?"),
                    result.size.unwrap_or(0)
                );
            }
            if result.success {
                0
            } else {
                if !json {
                    eprintln!(
                        "Backup failed: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
                1
            }
        }
        DbCommand::Restore {
            path,
            overwrite,
            no_validate,
            no_safety_backup,
            wal,
            shm,
            json,
        } => {
            let options = RestoreOptions {
                create_backup_before_restore: !no_safety_backup,
                validate_integrity: !no_validate,
                overwrite_existing: overwrite,
                restore_wal: wal,
                restore_shm: shm,
            };
            let result = manager.restore_from_backup(&path, Some(options)).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if result.success {
                println!(
                    "Restored database at {}",
                    result.restored_path.as_deref().unwrap_or("?")
                );
                if let Some(safety) = &result.backup_created {
                    println!("Safety snapshot: {safety}");
                }
            }
            if result.success {
                0
            } else {
                if !json {
                    eprintln!(
                        "Restore failed: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
                1
            }
        }
        DbCommand::Backups { json } => {
            let backups = manager.list_backups().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&backups)?);
            } else if backups.is_empty() {
                println!("No backups found.");
            } else {
                println!("{:<52} {:>12}  {:<26} WAL SHM", "Backup", "Bytes", "Created");
                for backup in &backups {
                    println!(
                        "{:<52} {:>12}  {:<26} {}   {}",
                        backup.id,
                        backup.size,
                        backup.timestamp,
                        flag(backup.wal_included),
                        flag(backup.shm_included)
                    );
                }
            }
            0
        }
        DbCommand::Delete { id } => {
            if manager.delete_backup(&id).await {
                println!("Deleted {id}");
                0
            } else {
                eprintln!("Could not delete {id}");
                1
            }
        }
        DbCommand::Cleanup { json } => {
            let deleted = manager.cleanup_old_backups().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&deleted)?);
            } else if deleted.is_empty() {
                println!("Nothing to clean up.");
            } else {
                for path in &deleted {
                    println!("Removed {path}");
                }
            }
            0
        }
        DbCommand::Verify { path } => {
            if manager.validate_backup(&path).await {
                println!("Backup is valid.");
                0
            } else {
                eprintln!("Backup failed validation: {}", path.display());
                1
            }
        }
        DbCommand::Stats { json } => {
            let stats = manager.get_backup_stats().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Backups      : {}", stats.total_backups);
                println!("Total size   : {} bytes", stats.total_size);
                println!(
                    "Newest       : {}",
                    stats.newest_backup.as_deref().unwrap_or("-")
                );
                println!(
                    "Oldest       : {}",
                    stats.oldest_backup.as_deref().unwrap_or("-")
                );
            }
            0
        }
    };

    manager.connection().close_and_clear().await;
    Ok(code)
}

fn flag(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no "
    }
}
