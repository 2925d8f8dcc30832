//! Backend core for the Parlance desktop chat application.
//!
//! The UI talks to this crate over a thin IPC layer (out of scope here);
//! everything below that boundary lives in this library: the live SQLite
//! pool, the chat schema, and the backup & recovery manager.

pub mod backup;
pub mod db;
pub mod error;
pub mod logging;
pub mod paths;
pub mod schema;
pub mod state;

pub use backup::{
    BackupManager, BackupMetadata, BackupOptions, BackupResult, BackupStats, RestoreOptions,
    RestoreResult,
};
pub use error::{AppError, AppResult};
pub use state::ConnectionHandle;

/// Install the global tracing subscriber.
pub fn init_logging() {
    logging::init();
}
