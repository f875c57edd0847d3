pub mod dual_sink;
pub mod error;
pub mod migrations;
pub mod models;
pub mod queries;
pub mod unit_of_work;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

pub use dual_sink::{MirrorEntity, NullSink, SaveOutcome, SecondarySink, SqliteMirror};
pub use error::{DbError, Result, is_unique_violation};
pub use queries::MessageCursor;
pub use unit_of_work::{Committed, UnitOfWork};

/// Primary (authoritative) store plus the best-effort secondary it mirrors to.
///
/// All writes go through [`Database::unit_of_work`], which routes every entity
/// through the dual-sink adapter; the secondary cannot be written around it.
pub struct Database {
    conn: Mutex<Connection>,
    secondary: Arc<dyn SecondarySink>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        migrations::run(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            secondary: Arc::new(NullSink),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            secondary: Arc::new(NullSink),
        })
    }

    /// Attach the secondary store every committed write is mirrored to.
    pub fn with_secondary(mut self, sink: Arc<dyn SecondarySink>) -> Self {
        info!("Secondary sink attached: {}", sink.name());
        self.secondary = sink;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }
}
