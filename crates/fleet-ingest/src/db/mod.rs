//! Database module for persistent storage.
//!
//! Uses rusqlite (SQLite) with a thread-safe `Database` handle.
//! All access is serialized through a `Mutex<Connection>`. Async callers go
//! through [`Database::run`], which executes on the blocking pool and can be
//! interrupted mid-statement: a cancelled or dropped call aborts the running
//! statement, so an abandoned operation never commits after its caller gave up.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

pub mod data_point_repo;
pub mod error;
pub mod file_repo;
pub mod lock_repo;
pub mod migrations;
pub mod stats_repo;

pub use error::DatabaseError;

/// Number of SQLite VM instructions between cancellation checks.
const PROGRESS_CHECK_OPS: i32 = 1_000;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe database handle wrapping a single rusqlite connection.
///
/// Cloning is cheap (inner `Arc`). WAL mode is enabled for file databases.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Sets the abort flag when the owning future is dropped before completion.
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Database {
    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        migrations::run_all(&conn)?;

        log::info!("Database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection on the current thread.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }

    /// Mutable variant of [`Database::with_conn`], needed to open transactions.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&mut Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&mut conn)
    }

    /// Runs `f` on the blocking pool. Dropping the returned future aborts the
    /// statement in progress.
    pub async fn run<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DatabaseError> + Send + 'static,
    {
        self.run_cancellable(&CancellationToken::new(), f).await
    }

    /// Like [`Database::run`], but also aborts when `cancel` fires. After a
    /// cancellation this still waits for the blocking task to settle, so the
    /// returned value reflects what actually reached the database.
    pub async fn run_cancellable<F, T, E>(&self, cancel: &CancellationToken, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DatabaseError> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(DatabaseError::Cancelled.into());
        }

        let abort = Arc::new(AtomicBool::new(false));
        let _guard = AbortOnDrop(Arc::clone(&abort));
        let conn = Arc::clone(&self.conn);
        let task_abort = Arc::clone(&abort);

        let mut handle = tokio::task::spawn_blocking(move || -> Result<T, E> {
            let mut conn = conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
            if task_abort.load(Ordering::Acquire) {
                return Err(DatabaseError::Cancelled.into());
            }

            let handler_flag = Arc::clone(&task_abort);
            conn.progress_handler(
                PROGRESS_CHECK_OPS,
                Some(move || handler_flag.load(Ordering::Acquire)),
            );
            let result = f(&mut *conn);
            conn.progress_handler(0, None::<fn() -> bool>);
            if !conn.is_autocommit() {
                // An interrupted statement can leave its transaction open.
                let _ = conn.execute_batch("ROLLBACK");
            }

            match result {
                Err(_) if task_abort.load(Ordering::Acquire) => Err(DatabaseError::Cancelled.into()),
                other => other,
            }
        });

        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = cancel.cancelled() => {
                abort.store(true, Ordering::Release);
                handle.await
            }
        };

        joined.map_err(|e| DatabaseError::Task(e.to_string()))?
    }

    /// Cheap liveness probe used by health checks.
    pub fn ping(&self) -> Result<(), DatabaseError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
            Ok(())
        })
    }
}
