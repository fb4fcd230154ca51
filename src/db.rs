//! # Database Handle
//!
//! [`DbHandle`] owns exactly one SQLite connection, either the writer
//! connection of a [`Storage`] or a read-only snapshot connection.
//!
//! ## Prepared Statements
//!
//! All SQL runs through the handle's statement cache ([`DbHandle::prepare`] /
//! [`DbHandle::prepare_ro`]), so repeated per-block statements are prepared
//! once per connection. `prepare_ro` is the read-only capability: the caller
//! asserts the statement will not mutate, and it is the only form legal on
//! snapshot handles.
//!
//! ## Snapshots
//!
//! A snapshot handle is a second connection to the same file, pinned on a
//! long-running deferred read transaction. WAL mode is required: with WAL, a
//! read transaction sees the database as of its start regardless of later
//! writer commits. Since SQLite has no "immediate" read transaction, the pin
//! issues `BEGIN` followed by a trivial `SELECT` that forces the read view to
//! materialize.
//!
//! Snapshot handles are reference-counted; dropping the handle rolls the
//! read transaction back and releases its reference, so a blocked
//! [`Storage::close_database`] can proceed.
//!
//! [`Storage`]: crate::Storage
//! [`Storage::close_database`]: crate::Storage::close_database

use std::os::raw::c_int;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, Once};

use rusqlite::{CachedStatement, Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Capacity of the per-connection prepared-statement cache.
///
/// The engine's working set is a few dozen distinct statements (engine
/// bookkeeping plus whatever the game logic runs per block).
const STATEMENT_CACHE_CAPACITY: usize = 64;

// =============================================================================
// SQLite Error Log
// =============================================================================

/// One-shot guard for the process-wide SQLite error log.
static ERROR_LOG_INIT: Once = Once::new();

/// Routes SQLite's internal error log into tracing.
fn sqlite_error_logger(code: c_int, msg: &str) {
    warn!("sqlite error (code {code}): {msg}");
}

/// Configures the process-wide SQLite error log once.
///
/// Must run before the first connection is opened; later calls are no-ops.
/// Failure to install the handler (e.g. because the embedding process opened
/// connections through another library first) is only a warning.
fn install_error_log() {
    ERROR_LOG_INIT.call_once(|| {
        info!("using SQLite version {}", rusqlite::version());
        // Safety: guarded by the Once and executed before this crate opens
        // any connection.
        match unsafe { rusqlite::trace::config_log(Some(sqlite_error_logger)) } {
            Ok(()) => info!("configured SQLite error handler"),
            Err(err) => warn!("failed to set up SQLite error handler: {err}"),
        }
    });
}

// =============================================================================
// Snapshot Gate
// =============================================================================

/// Reference count of outstanding snapshot handles, shared between a
/// [`Storage`](crate::Storage) and the snapshots it handed out.
///
/// The writer's close path blocks until the count reaches zero.
pub(crate) struct SnapshotGate {
    count: Mutex<usize>,
    released: Condvar,
}

impl SnapshotGate {
    pub(crate) fn new() -> Self {
        Self {
            count: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    /// Registers a new snapshot.
    pub(crate) fn acquire(&self) {
        let mut count = self.count.lock().expect("snapshot gate poisoned");
        *count += 1;
    }

    /// Unregisters a snapshot and wakes anyone waiting in
    /// [`wait_until_idle`](Self::wait_until_idle).
    ///
    /// # Panics
    ///
    /// Panics on underflow; a release without a matching acquire is a bug.
    pub(crate) fn release(&self) {
        let mut count = self.count.lock().expect("snapshot gate poisoned");
        assert!(*count > 0, "snapshot count underflow");
        *count -= 1;
        self.released.notify_all();
    }

    /// Blocks until no snapshots are outstanding.
    pub(crate) fn wait_until_idle(&self) {
        let mut count = self.count.lock().expect("snapshot gate poisoned");
        if *count > 0 {
            info!("waiting for {} outstanding snapshot(s) to finish", *count);
        }
        while *count > 0 {
            count = self
                .released
                .wait(count)
                .expect("snapshot gate poisoned");
        }
    }

    /// Current number of outstanding snapshots.
    pub(crate) fn active(&self) -> usize {
        *self.count.lock().expect("snapshot gate poisoned")
    }
}

// =============================================================================
// DbHandle
// =============================================================================

/// Owns one SQLite connection together with its prepared-statement cache.
///
/// Writer handles are created by `Storage` when the database is opened;
/// snapshot handles by [`Storage::get_snapshot`](crate::Storage::get_snapshot).
pub struct DbHandle {
    conn: Connection,
    wal: bool,
    /// Present iff this handle is a read-only snapshot; dropping the handle
    /// then rolls back the pinned read transaction and releases the gate.
    snapshot: Option<Arc<SnapshotGate>>,
}

impl DbHandle {
    /// Opens a connection to the given file with the given flags and
    /// negotiates WAL mode.
    pub(crate) fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        install_error_log();

        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, flags)?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        info!("opened SQLite database: {}", path.display());

        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let wal = mode.eq_ignore_ascii_case("wal");
        if wal {
            info!("set database to WAL mode");
        } else {
            warn!("failed to set WAL mode, journaling is {mode}; snapshots are unavailable");
        }

        Ok(Self {
            conn,
            wal,
            snapshot: None,
        })
    }

    /// Opens a read-only snapshot connection pinned on a deferred read
    /// transaction.
    ///
    /// The caller must have acquired `gate` already; the returned handle's
    /// drop releases it. On error the caller keeps the acquisition and must
    /// release it itself.
    pub(crate) fn open_snapshot(path: impl AsRef<Path>, gate: Arc<SnapshotGate>) -> Result<Self> {
        let mut db = Self::open(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        debug!("starting read transaction for snapshot");
        // A deferred transaction does not take its read view until the first
        // read, so issue a query we do not care about to pin it now.
        db.prepare_ro("BEGIN")?.execute([])?;
        let _: i64 = db
            .prepare_ro("SELECT COUNT(*) FROM `sqlite_master`")?
            .query_row([], |row| row.get(0))?;

        db.snapshot = Some(gate);
        Ok(db)
    }

    /// Whether the engine confirmed WAL journaling for this connection.
    pub fn is_wal(&self) -> bool {
        self.wal
    }

    /// Whether this handle is a read-only snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Returns a reset, cleared statement for `sql` from the cache,
    /// preparing and caching it on first use.
    ///
    /// # Panics
    ///
    /// Panics when called on a snapshot handle; use
    /// [`prepare_ro`](Self::prepare_ro) there.
    pub fn prepare(&self, sql: &str) -> Result<CachedStatement<'_>> {
        assert!(
            self.snapshot.is_none(),
            "write statement prepared on a read-only snapshot"
        );
        self.prepare_ro(sql)
    }

    /// Read-only variant of [`prepare`](Self::prepare): the caller asserts
    /// the statement does not mutate the database.
    pub fn prepare_ro(&self, sql: &str) -> Result<CachedStatement<'_>> {
        Ok(self.conn.prepare_cached(sql)?)
    }

    /// Direct access to the underlying connection for the engine's own
    /// schema setup and changeset plumbing.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        if let Some(gate) = self.snapshot.take() {
            debug!("ending snapshot read transaction");
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!("failed to end snapshot read transaction: {err}");
            }
            gate.release();
        }
        // Cached statements are finalized and the connection closed by their
        // own drops; close errors at teardown are not actionable.
    }
}

// =============================================================================
// Tests
// =============================================================================
