use std::sync::{Arc, RwLock};

use sqlx::SqlitePool;

/// Shared slot for the live database pool.
///
/// Replaces a process-global singleton: the handle is created at startup
/// and injected into every component that needs the live connection.
/// Restore is the only code path allowed to clear the slot, and only
/// after the pool is confirmed closed.
#[derive(Clone, Default)]
pub struct ConnectionHandle {
    inner: Arc<RwLock<Option<SqlitePool>>>,
}

impl ConnectionHandle {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(pool))),
        }
    }

    /// A handle with no live pool, as seen before initialization.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<SqlitePool> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap the slot's contents, returning the previous pool.
    pub fn replace(&self, pool: Option<SqlitePool>) -> Option<SqlitePool> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, pool)
    }

    /// Close the current pool, waiting for in-flight connections, and
    /// leave the slot empty so nothing can write through a stale handle.
    pub async fn close_and_clear(&self) {
        if let Some(pool) = self.replace(None) {
            pool.close().await;
        }
    }
}
